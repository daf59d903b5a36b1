use std::{io::Read, ops::Range};

use pkcs11_client::SignatureProvider;
use tracing::{debug, info};

use crate::error::{ContainerError, ContainerResult};

/// Fill digit of an unsigned placeholder
pub const PLACEHOLDER_DIGIT: u8 = b'0';

const PLACEHOLDER_OPEN: u8 = b'<';
const PLACEHOLDER_CLOSE: u8 = b'>';

/// A span of the document covered by the signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: usize,
    pub length: usize,
}

/// A document with a reserved `<00...00>` signature placeholder.
///
/// The signature covers the bytes before the opening `<` and after the closing `>`,
/// which is what a PDF `/ByteRange` describes.
#[derive(Debug, Clone)]
pub struct SignatureContainer {
    document: Vec<u8>,
    /// From the opening `<` to the closing `>` included
    placeholder: Range<usize>,
}

impl SignatureContainer {
    /// Build a document reserving room for a signature of up to `capacity` bytes
    /// between `header` and `trailer`
    #[must_use]
    pub fn prepare(header: &[u8], capacity: usize, trailer: &[u8]) -> Self {
        let mut document = Vec::with_capacity(header.len() + 2 * capacity + 2 + trailer.len());
        document.extend_from_slice(header);
        let start = document.len();
        document.push(PLACEHOLDER_OPEN);
        document.resize(document.len() + 2 * capacity, PLACEHOLDER_DIGIT);
        document.push(PLACEHOLDER_CLOSE);
        let end = document.len();
        document.extend_from_slice(trailer);
        Self {
            document,
            placeholder: start..end,
        }
    }

    /// Locate the placeholder that immediately follows the first occurrence of `marker`
    pub fn from_document(document: Vec<u8>, marker: &[u8]) -> ContainerResult<Self> {
        let not_found =
            || ContainerError::PlaceholderNotFound(String::from_utf8_lossy(marker).into_owned());
        let marker_at = document
            .windows(marker.len().max(1))
            .position(|w| w == marker)
            .ok_or_else(not_found)?;
        let start = marker_at + marker.len();
        if document.get(start) != Some(&PLACEHOLDER_OPEN) {
            return Err(not_found());
        }
        let close = document
            .iter()
            .skip(start)
            .position(|b| *b == PLACEHOLDER_CLOSE)
            .map(|p| start + p)
            .ok_or_else(|| ContainerError::MalformedPlaceholder("no closing '>'".to_owned()))?;
        let digits = document.get(start + 1..close).unwrap_or_default();
        if digits.len() % 2 != 0 || !digits.iter().all(u8::is_ascii_hexdigit) {
            return Err(ContainerError::MalformedPlaceholder(format!(
                "{} characters that are not hex byte pairs",
                digits.len()
            )));
        }
        Ok(Self {
            document,
            placeholder: start..close + 1,
        })
    }

    /// Signature bytes the placeholder can hold
    #[must_use]
    pub const fn capacity(&self) -> usize {
        (self.placeholder.end - self.placeholder.start - 2) / 2
    }

    /// The spans the signature covers
    #[must_use]
    pub fn byte_ranges(&self) -> [ByteRange; 2] {
        [
            ByteRange {
                offset: 0,
                length: self.placeholder.start,
            },
            ByteRange {
                offset: self.placeholder.end,
                length: self.document.len() - self.placeholder.end,
            },
        ]
    }

    /// The bytes the signature covers, as one stream
    pub fn signed_content(&self) -> impl Read + '_ {
        let (before, rest) = self.document.split_at(self.placeholder.start);
        let after = rest.get(self.placeholder.len()..).unwrap_or_default();
        before.chain(after)
    }

    fn digits(&self) -> &[u8] {
        self.document
            .get(self.placeholder.start + 1..self.placeholder.end - 1)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_signed(&self) -> bool {
        self.digits().iter().any(|d| *d != PLACEHOLDER_DIGIT)
    }

    /// Sign the document and embed the signature.
    ///
    /// The signature is streamed from the document, never copied whole. A signature
    /// shorter than the placeholder leaves the remaining digits at `0`.
    pub fn sign(&mut self, provider: &dyn SignatureProvider) -> ContainerResult<Vec<u8>> {
        if self.is_signed() {
            return Err(ContainerError::AlreadySigned);
        }
        let [first, second] = self.byte_ranges();
        debug!(
            "signing byte ranges [{} {} {} {}] with {}",
            first.offset,
            first.length,
            second.offset,
            second.length,
            provider.mechanism()
        );
        let signature = provider.sign_stream(&mut self.signed_content())?;
        if signature.len() > self.capacity() {
            return Err(ContainerError::PlaceholderTooSmall {
                needed: signature.len(),
                capacity: self.capacity(),
            });
        }
        let encoded = hex::encode(&signature);
        let start = self.placeholder.start + 1;
        if let Some(digits) = self.document.get_mut(start..start + encoded.len()) {
            digits.copy_from_slice(encoded.as_bytes());
        }
        info!(
            "embedded a {} bytes signature in a {} bytes placeholder",
            signature.len(),
            self.capacity()
        );
        Ok(signature)
    }

    /// The placeholder content, decoded; zero padded up to the capacity
    pub fn embedded_signature(&self) -> ContainerResult<Vec<u8>> {
        Ok(hex::decode(self.digits())?)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.document
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.document
    }
}
