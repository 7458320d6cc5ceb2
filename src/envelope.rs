//! Transport-neutral payload container and the [`Message`] trait.
//!
//! An [`Envelope`] pairs a type tag with serialized bytes. Commands arrive
//! in envelopes and replies leave in envelopes; the dispatcher resolves the
//! tag through the entity type's handler registry and decodes the bytes into
//! the typed message. Payload bytes are the JSON encoding of the message.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::EnvelopeError;

/// A typed payload that can travel inside an [`Envelope`].
///
/// `TYPE_TAG` must be unique among the messages a single entity type
/// accepts. A fully qualified name (e.g. `"com.example.IncreaseValue"`)
/// is the convention.
///
/// # Examples
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use valuefold::{Envelope, Message};
///
/// #[derive(Debug, PartialEq, Serialize, Deserialize)]
/// struct Ping {
///     seq: u32,
/// }
///
/// impl Message for Ping {
///     const TYPE_TAG: &'static str = "demo.Ping";
/// }
///
/// let env = Envelope::pack(&Ping { seq: 7 }).unwrap();
/// assert_eq!(env.type_tag(), "demo.Ping");
/// assert_eq!(env.unpack::<Ping>().unwrap(), Ping { seq: 7 });
/// ```
pub trait Message: Serialize + DeserializeOwned + Send + 'static {
    /// Identifies this message type inside an [`Envelope`].
    const TYPE_TAG: &'static str;
}

/// The empty reply, for commands that only acknowledge success.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

impl Message for Empty {
    const TYPE_TAG: &'static str = "valuefold.Empty";
}

/// Opaque, self-describing payload: a type tag plus serialized bytes.
///
/// Immutable once constructed. Build one with [`Envelope::pack`] for a
/// typed message or [`Envelope::new`] for bytes received from a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    type_tag: String,
    payload: Vec<u8>,
}

impl Envelope {
    /// Wrap raw bytes under the given type tag without inspecting them.
    pub fn new(type_tag: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            type_tag: type_tag.into(),
            payload: payload.into(),
        }
    }

    /// Serialize a typed message into an envelope tagged with
    /// `M::TYPE_TAG`.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Encode`] if the message cannot be
    /// serialized (e.g. a map with non-string keys).
    pub fn pack<M: Message>(message: &M) -> Result<Self, EnvelopeError> {
        let payload = serde_json::to_vec(message).map_err(|source| EnvelopeError::Encode {
            type_tag: M::TYPE_TAG,
            source,
        })?;
        Ok(Self {
            type_tag: M::TYPE_TAG.to_owned(),
            payload,
        })
    }

    /// Decode the payload as `M`, checking the type tag first.
    ///
    /// # Errors
    ///
    /// * [`EnvelopeError::TypeMismatch`] -- the tag is not `M::TYPE_TAG`.
    /// * [`EnvelopeError::Decode`] -- the bytes are not a valid `M`.
    pub fn unpack<M: Message>(&self) -> Result<M, EnvelopeError> {
        if self.type_tag != M::TYPE_TAG {
            return Err(EnvelopeError::TypeMismatch {
                expected: M::TYPE_TAG,
                found: self.type_tag.clone(),
            });
        }
        self.decode_unchecked()
    }

    /// Decode the payload as `M` without looking at the tag.
    ///
    /// Used by the dispatcher once the registry has already resolved the
    /// tag to `M`.
    pub(crate) fn decode_unchecked<M: Message>(&self) -> Result<M, EnvelopeError> {
        serde_json::from_slice(&self.payload).map_err(|source| EnvelopeError::Decode {
            type_tag: self.type_tag.clone(),
            source,
        })
    }

    /// The type tag identifying the payload.
    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    /// The serialized payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns `true` if this envelope carries an `M`.
    pub fn is<M: Message>(&self) -> bool {
        self.type_tag == M::TYPE_TAG
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct SetLabel {
        label: String,
    }

    impl Message for SetLabel {
        const TYPE_TAG: &'static str = "test.SetLabel";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Other {
        n: i32,
    }

    impl Message for Other {
        const TYPE_TAG: &'static str = "test.Other";
    }

    #[test]
    fn pack_sets_tag_and_json_payload() {
        let env = Envelope::pack(&SetLabel {
            label: "x".into(),
        })
        .expect("pack should succeed");
        assert_eq!(env.type_tag(), "test.SetLabel");
        assert_eq!(env.payload(), br#"{"label":"x"}"#);
        assert!(env.is::<SetLabel>());
        assert!(!env.is::<Other>());
    }

    #[test]
    fn unpack_rejects_wrong_tag() {
        let env = Envelope::pack(&Other { n: 1 }).expect("pack should succeed");
        let err = env.unpack::<SetLabel>().unwrap_err();
        assert!(
            matches!(
                err,
                EnvelopeError::TypeMismatch {
                    expected: "test.SetLabel",
                    ref found,
                } if found == "test.Other"
            ),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn unpack_reports_malformed_bytes() {
        let env = Envelope::new("test.Other", b"{\"n\": \"not a number\"}".to_vec());
        let err = env.unpack::<Other>().unwrap_err();
        assert!(matches!(err, EnvelopeError::Decode { .. }));
        assert!(err.to_string().contains("test.Other"));
    }

    #[test]
    fn empty_reply_encodes_as_empty_object() {
        let env = Envelope::pack(&Empty {}).expect("pack should succeed");
        assert_eq!(env.type_tag(), Empty::TYPE_TAG);
        assert_eq!(env.payload(), b"{}");
        assert_eq!(env.unpack::<Empty>().unwrap(), Empty {});
    }

    #[test]
    fn envelope_serde_roundtrip_preserves_bytes() {
        let env = Envelope::new("raw.Bytes", vec![0u8, 159, 146, 150]);
        let json = serde_json::to_string(&env).expect("serialize");
        let back: Envelope = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, env);
    }
}
