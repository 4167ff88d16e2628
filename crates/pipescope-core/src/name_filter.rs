use globset::{GlobBuilder, GlobMatcher};

/// Case-insensitive text filter over pipeline names.
///
/// The text is treated as a glob that may match anywhere in the name, so
/// plain text behaves like a substring search and `*`/`?` work as wildcards.
/// Every other character, brackets and braces included, matches literally.
/// Empty text matches everything.
#[derive(Debug, Clone, Default)]
pub struct NameFilter {
    text: String,
    matcher: Option<GlobMatcher>,
}

impl NameFilter {
    pub fn new(text: &str) -> Self {
        let text = text.trim().to_string();
        if text.is_empty() {
            return Self::default();
        }
        let matcher = GlobBuilder::new(&format!("*{}*", escape_literals(&text)))
            .case_insensitive(true)
            .backslash_escape(false)
            .build()
            .ok()
            .map(|glob| glob.compile_matcher());
        Self { text, matcher }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn matches(&self, name: &str) -> bool {
        if self.text.is_empty() {
            return true;
        }
        match &self.matcher {
            Some(matcher) => matcher.is_match(name),
            None => name.to_lowercase().contains(&self.text.to_lowercase()),
        }
    }
}

/// Wrap glob syntax other than `*` and `?` in a one-character class.
fn escape_literals(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '[' | ']' | '{' | '}' => {
                escaped.push('[');
                escaped.push(ch);
                escaped.push(']');
            }
            _ => escaped.push(ch),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_matches_everything() {
        let filter = NameFilter::new("   ");
        assert!(filter.is_empty());
        assert!(filter.matches("playbin0"));
        assert!(filter.matches(""));
    }

    #[test]
    fn plain_text_is_case_insensitive_substring() {
        let filter = NameFilter::new("PlayBin");
        assert!(filter.matches("media-playbin3"));
        assert!(!filter.matches("webrtcbin0"));
    }

    #[test]
    fn wildcards_are_honoured() {
        let filter = NameFilter::new("web*bin");
        assert!(filter.matches("webrtcbin0"));
        assert!(filter.matches("my-webkit-mediabin"));
        assert!(!filter.matches("playbin0"));

        let single = NameFilter::new("bin?");
        assert!(single.matches("playbin3"));
        assert!(!single.matches("playbin"));
    }

    #[test]
    fn unbalanced_bracket_is_literal() {
        let filter = NameFilter::new("src[");
        assert!(filter.matches("appSRC[0]"));
        assert!(!filter.matches("appsrc0"));
    }

    #[test]
    fn brackets_and_braces_match_literally() {
        let filter = NameFilter::new("queue[0]");
        assert!(filter.matches("Queue[0]-sink"));
        assert!(!filter.matches("queue0"));

        let braces = NameFilter::new("{a,b}");
        assert!(braces.matches("mux{a,b}"));
        assert!(!braces.matches("mux-a"));

        let mixed = NameFilter::new("tee[*]");
        assert!(mixed.matches("tee[src_3]"));
        assert!(!mixed.matches("tee_src_3"));
    }

    #[test]
    fn backslash_is_literal() {
        let filter = NameFilter::new("a\\b");
        assert!(filter.matches("x-a\\b"));
        assert!(!filter.matches("ab"));
    }
}
