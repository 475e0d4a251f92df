//! Server-sent-event framing for the research stream (spec.md §6 "Response
//! body (SSE)"). The body is the raw UTF-8 output buffer — plain text
//! chunks containing the literal `<report-plan>`/`<search-task>`/
//! `<final-report>` sentinels, not a JSON event envelope — so framing only
//! needs to satisfy the wire-format rule that a `data:` line may not
//! contain a bare newline.

/// Frame one output chunk as an SSE `message` event. Chunks may themselves
/// contain newlines (a plan or report is multi-line prose), so each line is
/// emitted as its own `data:` field per the SSE spec.
pub fn format_chunk(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    out.push_str("event: message\n");
    if text.is_empty() {
        out.push_str("data:\n");
    } else {
        for line in text.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
    }
    out.push('\n');
    out
}

/// A comment line carrying no event — keeps idle connections (load
/// balancers, browsers) from timing out the socket.
pub fn format_keepalive() -> String {
    ": keepalive\n\n".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_chunk_is_one_data_field() {
        let framed = format_chunk("<report-plan>");
        assert_eq!(framed, "event: message\ndata: <report-plan>\n\n");
    }

    #[test]
    fn multiline_chunk_splits_into_multiple_data_fields() {
        let framed = format_chunk("line one\nline two");
        assert_eq!(
            framed,
            "event: message\ndata: line one\ndata: line two\n\n"
        );
    }

    #[test]
    fn empty_chunk_still_frames_a_blank_data_field() {
        assert_eq!(format_chunk(""), "event: message\ndata:\n\n");
    }

    #[test]
    fn keepalive_is_a_bare_comment() {
        assert_eq!(format_keepalive(), ": keepalive\n\n");
    }
}
