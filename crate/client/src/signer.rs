use std::io::Read;

use crate::{
    PResult, client::Client, credential::Credential, mechanism::Mechanism,
    session_manager::SlotSelector,
};

/// What an external signing container needs from a token: turn a byte stream into a
/// signature with a fixed key and mechanism. Implementations know nothing of the
/// document being signed.
pub trait SignatureProvider {
    fn mechanism(&self) -> Mechanism;

    fn sign_stream(&self, data: &mut dyn Read) -> PResult<Vec<u8>>;
}

/// Signs with a named key on a token; every call runs in its own session
pub struct TokenSigner<'a> {
    client: &'a Client,
    token: SlotSelector,
    credential: Option<Credential>,
    key_label: String,
    mechanism: Mechanism,
}

impl<'a> TokenSigner<'a> {
    pub fn new(
        client: &'a Client,
        token: SlotSelector,
        credential: Option<Credential>,
        key_label: impl Into<String>,
        mechanism: Mechanism,
    ) -> Self {
        Self {
            client,
            token,
            credential,
            key_label: key_label.into(),
            mechanism,
        }
    }

    #[must_use]
    pub fn key_label(&self) -> &str {
        &self.key_label
    }

    /// The signer certificate, when one is stored under the key label
    pub fn certificate(&self) -> PResult<Vec<u8>> {
        self.client
            .read_certificate(&self.token, self.credential.as_ref(), &self.key_label)
    }
}

impl SignatureProvider for TokenSigner<'_> {
    fn mechanism(&self) -> Mechanism {
        self.mechanism.clone()
    }

    fn sign_stream(&self, data: &mut dyn Read) -> PResult<Vec<u8>> {
        self.client.sign_with_key(
            &self.token,
            self.credential.as_ref(),
            &self.key_label,
            Some(&self.mechanism),
            data,
        )
    }
}
