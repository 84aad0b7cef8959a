//! Detection of delegation directives embedded in AI replies.
//!
//! A directive is the text between [`OPEN_MARKER`] and [`CLOSE_MARKER`].
//! Only the first well-formed pair counts; anything after it stays literal.
//! An opening marker without a matching close (or with a second opening
//! marker before the close) is treated as no directive at all, so a truncated
//! reply never executes half an instruction.

pub const OPEN_MARKER: &str = "<gemini-cli>";
pub const CLOSE_MARKER: &str = "</gemini-cli>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationDirective {
    pub command_payload: String,
    pub commentary: String,
}

#[must_use]
pub fn parse(response: &str) -> Option<DelegationDirective> {
    let open = response.find(OPEN_MARKER)?;
    let payload_start = open + OPEN_MARKER.len();
    let payload_len = response[payload_start..].find(CLOSE_MARKER)?;
    let payload = &response[payload_start..payload_start + payload_len];
    if payload.contains(OPEN_MARKER) {
        return None;
    }

    let before = &response[..open];
    let after = &response[payload_start + payload_len + CLOSE_MARKER.len()..];
    let head = before.trim_end();
    let gap = if head.len() < before.len() && !after.starts_with(char::is_whitespace) {
        " "
    } else {
        ""
    };
    let commentary = format!("{head}{gap}{after}");
    Some(DelegationDirective {
        command_payload: payload.to_owned(),
        commentary: commentary.trim().to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_payload_and_commentary() {
        let directive = parse("Sure, I'll do it. <gemini-cli>echo hi</gemini-cli> Done!").unwrap();
        assert_eq!(directive.command_payload, "echo hi");
        assert_eq!(directive.commentary, "Sure, I'll do it. Done!");
    }

    #[test]
    fn payload_is_exact_enclosed_text() {
        let directive = parse("<gemini-cli>\n  create index.html\n</gemini-cli>\nCreating it.").unwrap();
        assert_eq!(directive.command_payload, "\n  create index.html\n");
        assert_eq!(directive.commentary, "Creating it.");
    }

    #[test]
    fn keeps_one_space_where_the_block_was() {
        let directive = parse("Hello, <gemini-cli>x</gemini-cli>world").unwrap();
        assert_eq!(directive.commentary, "Hello, world");
        let directive = parse("Hello,<gemini-cli>x</gemini-cli>world").unwrap();
        assert_eq!(directive.commentary, "Hello,world");
        let directive = parse("Working on it.\n<gemini-cli>x</gemini-cli>").unwrap();
        assert_eq!(directive.commentary, "Working on it.");
    }

    #[test]
    fn no_markers_means_no_directive() {
        let text = "Which language would you like to use?";
        assert_eq!(parse(text), None);
    }

    #[test]
    fn unclosed_marker_is_ignored() {
        let text = "Working on it <gemini-cli>rm -rf buil";
        assert_eq!(parse(text), None);
    }

    #[test]
    fn reopened_marker_is_malformed() {
        assert_eq!(parse("<gemini-cli>a <gemini-cli>b</gemini-cli>"), None);
    }

    #[test]
    fn only_first_pair_is_honored() {
        let directive =
            parse("one <gemini-cli>ls</gemini-cli> two <gemini-cli>pwd</gemini-cli>").unwrap();
        assert_eq!(directive.command_payload, "ls");
        assert_eq!(
            directive.commentary,
            "one two <gemini-cli>pwd</gemini-cli>"
        );
    }

    #[test]
    fn close_before_open_stays_literal() {
        let directive = parse("</gemini-cli> x <gemini-cli>ls</gemini-cli>").unwrap();
        assert_eq!(directive.command_payload, "ls");
        assert_eq!(directive.commentary, "</gemini-cli> x");
    }
}
