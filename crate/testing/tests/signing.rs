use std::io::Read;

use pkcs11_client::{
    Client, ClientConfig, Credential, KeyType, Mechanism, PResult, SignatureProvider,
    SlotSelector, TokenSigner,
    mock::{MockModule, MockObject, MockToken, NativeFunction},
};
use pkcs11_testing::{ContainerError, SignatureContainer};
use serial_test::serial;
use sha3::{Digest, Sha3_256};

const HEADER: &[u8] = b"%PDF-1.7\n1 0 obj << /Type /Sig /Contents ";
const TRAILER: &[u8] = b" >>\nendobj\n%%EOF\n";

/// Hashes in software: the container only sees the provider interface
struct DigestProvider;

impl SignatureProvider for DigestProvider {
    fn mechanism(&self) -> Mechanism {
        Mechanism::Custom {
            mechanism_type: 0x8000_0001,
            parameter: Vec::new(),
            key_type: KeyType::Ec,
        }
    }

    fn sign_stream(&self, data: &mut dyn Read) -> PResult<Vec<u8>> {
        let mut digest = Sha3_256::new();
        let mut content = Vec::new();
        data.read_to_end(&mut content)?;
        digest.update(&content);
        Ok(digest.finalize().to_vec())
    }
}

fn token() -> MockModule {
    MockModule::new().with_token(
        MockToken::new(1, "qualified signature")
            .user_pin("9999")
            .object(MockObject::private_key("signer", KeyType::Rsa))
            .object(MockObject::certificate("signer", b"signer certificate".to_vec())),
    )
}

#[test]
fn software_provider_signs_everything_but_the_placeholder() {
    let mut container = SignatureContainer::prepare(HEADER, 64, TRAILER);
    let signature = container.sign(&DigestProvider).unwrap();

    let expected = Sha3_256::digest([HEADER, TRAILER].concat()).to_vec();
    assert_eq!(signature, expected);
    assert!(container.is_signed());
    let embedded = container.embedded_signature().unwrap();
    assert_eq!(embedded.len(), 64);
    assert_eq!(&embedded[..32], expected.as_slice());
    assert!(embedded[32..].iter().all(|b| *b == 0));

    assert!(matches!(
        container.sign(&DigestProvider),
        Err(ContainerError::AlreadySigned)
    ));
}

#[test]
#[serial]
fn token_signer_fills_the_placeholder() {
    pkcs11_logger::log_init(None);
    let mock = token();
    let client = Client::with_module(mock.boxed(), "mock", ClientConfig::new("mock")).unwrap();
    let signer = TokenSigner::new(
        &client,
        SlotSelector::label("qualified signature"),
        Some(Credential::user("9999")),
        "signer",
        Mechanism::Sha256RsaPkcsPss,
    );
    assert_eq!(signer.certificate().unwrap(), b"signer certificate");

    let prepared = SignatureContainer::prepare(HEADER, 32, TRAILER).into_bytes();
    let mut container = SignatureContainer::from_document(prepared, b"/Contents ").unwrap();
    let signature = container.sign(&signer).unwrap();
    assert_eq!(container.embedded_signature().unwrap(), signature);

    // the same bytes signed directly give the same signature
    let direct = client
        .sign_with_key(
            &SlotSelector::Index(0),
            Some(&Credential::user("9999")),
            "signer",
            Some(&Mechanism::Sha256RsaPkcsPss),
            [HEADER, TRAILER].concat().as_slice(),
        )
        .unwrap();
    assert_eq!(signature, direct);
    assert_eq!(mock.open_sessions(), 0);
}

#[test]
#[serial]
fn placeholder_too_small_leaves_the_document_untouched() {
    let mock = token();
    let client = Client::with_module(mock.boxed(), "mock", ClientConfig::new("mock")).unwrap();
    let signer = TokenSigner::new(
        &client,
        SlotSelector::Index(0),
        Some(Credential::user("9999")),
        "signer",
        Mechanism::Sha256RsaPkcs,
    );
    let mut container = SignatureContainer::prepare(HEADER, 16, TRAILER);
    let before = container.as_bytes().to_vec();
    assert!(matches!(
        container.sign(&signer),
        Err(ContainerError::PlaceholderTooSmall {
            needed: 32,
            capacity: 16
        })
    ));
    assert_eq!(container.as_bytes(), before.as_slice());
    assert!(!container.is_signed());

    let wrong_pin = TokenSigner::new(
        &client,
        SlotSelector::Index(0),
        Some(Credential::user("0000")),
        "signer",
        Mechanism::Sha256RsaPkcs,
    );
    assert!(matches!(
        container.sign(&wrong_pin),
        Err(ContainerError::Signing(_))
    ));
    assert_eq!(mock.count(NativeFunction::SignInit), 1);
}
