pub const IDENTIFY_PREFIX: &str = "BrowserConnected|";
pub const VISIT_PREFIX: &str = "VisitedURL:";

/// A decoded text frame from a browser agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage<'a> {
    /// The agent announces (or changes) its label.
    Identify(&'a str),
    /// One visited URL, stored verbatim.
    Visit(&'a str),
    /// Anything else. Ignored so newer agents can talk to older hubs.
    Other,
}

impl<'a> ClientMessage<'a> {
    pub fn parse(text: &'a str) -> Self {
        if let Some(label) = text.strip_prefix(IDENTIFY_PREFIX) {
            return ClientMessage::Identify(label);
        }
        if let Some(url) = text.strip_prefix(VISIT_PREFIX) {
            return ClientMessage::Visit(url);
        }
        ClientMessage::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_identity_announcement_remainder_verbatim() {
        assert_eq!(
            ClientMessage::parse("BrowserConnected|Firefox 128.0"),
            ClientMessage::Identify("Firefox 128.0")
        );
        assert_eq!(
            ClientMessage::parse("BrowserConnected|a|b"),
            ClientMessage::Identify("a|b")
        );
    }

    #[test]
    fn parses_visit_with_embedded_colons() {
        assert_eq!(
            ClientMessage::parse("VisitedURL:https://example.com:8443/a?b=c"),
            ClientMessage::Visit("https://example.com:8443/a?b=c")
        );
    }

    #[test]
    fn prefixes_are_case_sensitive_and_anchored() {
        assert_eq!(ClientMessage::parse("visitedurl:http://a"), ClientMessage::Other);
        assert_eq!(ClientMessage::parse(" VisitedURL:http://a"), ClientMessage::Other);
        assert_eq!(ClientMessage::parse("BrowserConnected"), ClientMessage::Other);
        assert_eq!(ClientMessage::parse(""), ClientMessage::Other);
    }
}
