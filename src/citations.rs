use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

pub const SOURCES_MARKER: &str = "[SOURCES]";

// Greedy prefix so the last marker in the text is the one tried.
static SOURCES_TRAILER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\A(.*)\[SOURCES\](\[.*\])\s*\z").expect("trailer pattern compiles"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub file: String,
    pub page: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedResponse {
    pub content: String,
    pub sources: Vec<Citation>,
}

pub fn parse_response(text: &str) -> ParsedResponse {
    let unchanged = || ParsedResponse { content: text.to_string(), sources: Vec::new() };
    let Some(caps) = SOURCES_TRAILER.captures(text) else { return unchanged() };
    let (Some(body), Some(json)) = (caps.get(1), caps.get(2)) else { return unchanged() };
    match serde_json::from_str::<Vec<Citation>>(json.as_str()) {
        Ok(sources) => ParsedResponse { content: body.as_str().trim_end().to_string(), sources },
        Err(e) => {
            tracing::debug!(error = %e, "discarding malformed sources trailer");
            unchanged()
        }
    }
}

/// Longest prefix of a still-growing answer that will survive parsing.
/// Whatever a renderer has printed from it is a prefix of the final content.
pub fn displayable_prefix(partial: &str) -> &str {
    let cut = partial
        .match_indices(SOURCES_MARKER)
        .map(|(at, _)| at)
        .find(|&at| could_become_trailer(&partial[at + SOURCES_MARKER.len()..]))
        .unwrap_or(partial.len());
    let mut visible = &partial[..cut];
    for len in (1..SOURCES_MARKER.len()).rev() {
        if visible.ends_with(&SOURCES_MARKER[..len]) {
            visible = &visible[..visible.len() - len];
            break;
        }
    }
    visible.trim_end()
}

// True while `rest` can still grow into a JSON array followed only by whitespace.
fn could_become_trailer(rest: &str) -> bool {
    if rest.is_empty() {
        return true;
    }
    if !rest.starts_with('[') {
        return false;
    }
    let (mut depth, mut in_string, mut escaped) = (0usize, false, false);
    for (i, c) in rest.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '[' | '{' => depth += 1,
            ']' | '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return rest[i + c.len_utf8()..].trim().is_empty();
                }
            }
            _ => {}
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_trailer_and_blank_lines() {
        let parsed = parse_response("Answer text\n\n[SOURCES][{\"file\":\"a.pdf\",\"page\":3}]");
        assert_eq!(parsed.content, "Answer text");
        assert_eq!(parsed.sources, vec![Citation { file: "a.pdf".into(), page: 3 }]);
    }

    #[test]
    fn empty_trailer_still_stripped() {
        let parsed = parse_response("Please upload a PDF first.\n\n[SOURCES][]");
        assert_eq!(parsed.content, "Please upload a PDF first.");
        assert!(parsed.sources.is_empty());
    }

    #[test]
    fn no_marker_leaves_text_alone() {
        let text = "Rule 12 of the Coal Mines Regulations applies.";
        let parsed = parse_response(text);
        assert_eq!(parsed.content, text);
        assert!(parsed.sources.is_empty());
    }

    #[test]
    fn malformed_json_keeps_marker_in_text() {
        let text = "Answer\n\n[SOURCES][{\"file\":\"a.pdf\",\"page\":}]";
        let parsed = parse_response(text);
        assert_eq!(parsed.content, text);
        assert!(parsed.sources.is_empty());
    }

    #[test]
    fn marker_in_the_middle_is_not_a_trailer() {
        let text = "The literal [SOURCES][1] appears here, then more prose.";
        assert_eq!(parse_response(text).content, text);

        let text = "Mid [SOURCES][1] then prose [x]";
        let parsed = parse_response(text);
        assert_eq!(parsed.content, text);
        assert!(parsed.sources.is_empty());
    }

    #[test]
    fn last_marker_wins() {
        let text = "Quoting [SOURCES][] inline.\n\n[SOURCES][{\"file\":\"dgms.pdf\",\"page\":7},{\"file\":\"mmdr.pdf\",\"page\":1}]\n";
        let parsed = parse_response(text);
        assert_eq!(parsed.content, "Quoting [SOURCES][] inline.");
        assert_eq!(parsed.sources.len(), 2);
        assert_eq!(parsed.sources[1].file, "mmdr.pdf");
    }

    #[test]
    fn display_prefix_holds_back_partial_marker() {
        assert_eq!(displayable_prefix("Hello"), "Hello");
        assert_eq!(displayable_prefix("Hello\n\n"), "Hello");
        assert_eq!(displayable_prefix("Hello\n\n[SOU"), "Hello");
        assert_eq!(displayable_prefix("Hello\n\n[SOURCES][{\"fi"), "Hello");
        assert_eq!(displayable_prefix("array [1, 2"), "array [1, 2");
    }

    #[test]
    fn literal_marker_in_prose_keeps_typing() {
        assert_eq!(displayable_prefix("See the literal [SOURCES] tag"), "See the literal [SOURCES] tag");
        assert_eq!(
            displayable_prefix("See the literal [SOURCES] tag in Rule 5 and Rule 6."),
            "See the literal [SOURCES] tag in Rule 5 and Rule 6."
        );
        assert_eq!(displayable_prefix("Mid [SOURCES][1] then prose"), "Mid [SOURCES][1] then prose");
        assert_eq!(displayable_prefix("Mid [SOURCES][1] then\n\n[SOURCES]["), "Mid [SOURCES][1] then");
        // a bracket inside a file name does not close the array
        assert_eq!(displayable_prefix("Answer\n\n[SOURCES][{\"file\":\"a].pdf\""), "Answer");
    }

    #[test]
    fn display_prefix_is_prefix_of_final_content() {
        let answers = [
            "Section 40 covers it.\n\n[SOURCES][{\"file\":\"act.pdf\",\"page\":2}]",
            "Quoting [SOURCES][] inline, then [SOURCES] alone.\n\n[SOURCES][{\"file\":\"b[1].pdf\",\"page\":5}]\n",
            "The tag [SOURCES] shows up in prose only.",
        ];
        for full in answers {
            let content = parse_response(full).content;
            for end in (0..=full.len()).filter(|i| full.is_char_boundary(*i)) {
                let shown = displayable_prefix(&full[..end]);
                assert!(content.starts_with(shown), "{shown:?} is not a prefix of {content:?}");
            }
        }
    }
}
