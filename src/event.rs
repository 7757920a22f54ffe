/// Classification of an [`Envelope`](crate::Envelope) by its `name` field.
///
/// | `name`            | kind                           | forwarded to  |
/// |-------------------|--------------------------------|---------------|
/// | `"log"`           | [`EventKind::Log`]             | log           |
/// | `"event"`         | [`EventKind::Event`]           | log           |
/// | `"auth"`          | [`EventKind::Auth`]            | log, then mail|
/// | anything else     | [`EventKind::Unrecognized`]    | log           |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Log,
    Event,
    Auth,
    /// Any other name, including the empty name of an undecodable body.
    Unrecognized,
}

impl EventKind {
    /// Classify an event name. Matching is exact and case-sensitive.
    pub fn classify(name: &str) -> Self {
        match name {
            "log" => Self::Log,
            "event" => Self::Event,
            "auth" => Self::Auth,
            _ => Self::Unrecognized,
        }
    }

    /// Whether events of this kind may trigger a mail send.
    pub fn sends_mail(self) -> bool {
        matches!(self, Self::Auth)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Log => "log",
            Self::Event => "event",
            Self::Auth => "auth",
            Self::Unrecognized => "unrecognized",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_names() {
        assert_eq!(EventKind::classify("log"), EventKind::Log);
        assert_eq!(EventKind::classify("event"), EventKind::Event);
        assert_eq!(EventKind::classify("auth"), EventKind::Auth);
    }

    #[test]
    fn everything_else_is_unrecognized() {
        for name in ["", "AUTH", "Log", "auth ", "mail", "user.created"] {
            assert_eq!(EventKind::classify(name), EventKind::Unrecognized, "{name:?}");
        }
    }

    #[test]
    fn only_auth_sends_mail() {
        assert!(EventKind::Auth.sends_mail());
        assert!(!EventKind::Log.sends_mail());
        assert!(!EventKind::Event.sends_mail());
        assert!(!EventKind::Unrecognized.sends_mail());
    }
}
