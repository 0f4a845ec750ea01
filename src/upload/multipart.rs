//! Multipart framing helpers

/// Boundary used for explain uploads
pub const UPLOAD_BOUNDARY: &str = "----ESP32_CAMERA_BOUNDARY";

/// File name announced for the JPEG part
pub const UPLOAD_FILE_NAME: &str = "camera.jpg";

/// `Content-Type` header value for a form-data body
pub fn form_data_content_type(boundary: &str) -> String {
    format!("multipart/form-data; boundary={boundary}")
}

/// Text form field, complete with its trailing CRLF
pub fn text_field(boundary: &str, name: &str, value: &str) -> String {
    format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"{name}\"\r\n\
         \r\n\
         {value}\r\n"
    )
}

/// Header of a JPEG file part; the payload follows directly
pub fn file_part_header(boundary: &str, name: &str, file_name: &str) -> String {
    format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\n\
         Content-Type: image/jpeg\r\n\
         \r\n"
    )
}

/// Closing delimiter ending the last part and the body
pub fn closing_boundary(boundary: &str) -> String {
    format!("\r\n--{boundary}--\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn form_layout_matches_rfc_7578() {
        let mut body = text_field("B", "question", "what is this?");
        body.push_str(&file_part_header("B", "file", "camera.jpg"));
        body.push_str("JPEG");
        body.push_str(&closing_boundary("B"));

        assert_eq!(
            body,
            "--B\r\nContent-Disposition: form-data; name=\"question\"\r\n\r\nwhat is this?\r\n\
             --B\r\nContent-Disposition: form-data; name=\"file\"; filename=\"camera.jpg\"\r\n\
             Content-Type: image/jpeg\r\n\r\nJPEG\r\n--B--\r\n"
        );
    }

    #[test]
    fn content_type_names_boundary() {
        assert_eq!(
            form_data_content_type(UPLOAD_BOUNDARY),
            "multipart/form-data; boundary=----ESP32_CAMERA_BOUNDARY"
        );
    }
}
