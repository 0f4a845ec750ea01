//! Live view: multipart MJPEG responder and snapshot replies
//!
//! Unlike the explain upload, the live stream never uses the chunk channel.
//! Every iteration grabs one frame, converts it if needed, writes it as one
//! multipart part and releases it, so the loop's own pace is the backpressure.

mod endpoint;
mod responder;

pub use endpoint::{HttpReply, snapshot, stream_response_headers};
pub use responder::{
    LiveStreamResponder, LiveStreamSettings, MultipartSink, StreamEnd, StreamSummary,
    StreamSwitch, part_header,
};
