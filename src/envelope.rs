/// Decoded event notification received from the broker.
///
/// `Envelope` is the typed view of an inbound message body. It is created
/// once per delivery by [`Envelope::decode`], handed to the dispatcher by
/// value, and dropped when the handler returns.
///
/// ## Wire format
///
/// ```json
/// {"name": "auth", "data": "login", "mail": {"to": "...", "subject": "...", "message": "..."}}
/// ```
///
/// `mail` is optional and omitted from the serialized form when absent.
/// Missing or `null` string fields decode to empty strings.
///
/// ## Example
///
/// ```rust
/// use listen_service::Envelope;
///
/// let envelope = Envelope::decode(br#"{"name":"log","data":"disk full"}"#);
/// assert_eq!(envelope.name, "log");
/// assert!(envelope.mail.is_none());
///
/// // Malformed bodies never fail, they decode to the zero value.
/// assert_eq!(Envelope::decode(b"not json"), Envelope::default());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Envelope {
    /// Event name, used for routing.
    #[serde(deserialize_with = "null_as_empty")]
    pub name: String,
    /// Opaque application payload.
    #[serde(deserialize_with = "null_as_empty")]
    pub data: String,
    /// Mail request carried by mail-triggering events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mail: Option<MailInfo>,
}

impl Envelope {
    /// Decode a raw message body.
    ///
    /// Decoding is best-effort: a body that is not a JSON document of the
    /// expected shape yields [`Envelope::default`] so the message still flows
    /// through the default route.
    pub fn decode(body: &[u8]) -> Self {
        match serde_json::from_slice(body) {
            Ok(envelope) => envelope,
            Err(error) => {
                tracing::warn!(%error, bytes = body.len(), "Undecodable message body");
                Self::default()
            }
        }
    }
}

/// Mail request attached to an authentication event.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct MailInfo {
    #[serde(deserialize_with = "null_as_empty")]
    pub to: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub subject: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub message: String,
}

impl MailInfo {
    /// Names of the fields that are empty.
    ///
    /// A mail request is only sendable when this is empty.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        [
            ("to", &self.to),
            ("subject", &self.subject),
            ("message", &self.message),
        ]
        .into_iter()
        .filter(|(_, value)| value.is_empty())
        .map(|(field, _)| field)
        .collect()
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<String> = serde::Deserialize::deserialize(deserializer)?;
    Ok(value.unwrap_or_default())
}
