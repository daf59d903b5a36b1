//! End-to-end runs of the client against the in-memory module.

use std::{
    io::Cursor,
    sync::Barrier,
    thread,
    time::Duration,
};

use pkcs11_client::{
    AccessMode, Client, ClientConfig, Credential, DEFAULT_CHUNK_SIZE, KeyType, Mechanism,
    ObjectClass, PError, PResult, SessionState, SlotSelector,
    mock::{MockModule, MockObject, MockToken, NativeFunction},
};
use serial_test::serial;

const PIN: &str = "4321";

fn signing_token() -> MockModule {
    MockModule::new().with_token(
        MockToken::new(3, "signing token")
            .user_pin(PIN)
            .object(MockObject::private_key("rsa-2048", KeyType::Rsa).id(&[0x01]))
            .object(MockObject::public_key("rsa-2048", KeyType::Rsa).id(&[0x01]))
            .object(MockObject::private_key("p-256", KeyType::Ec).id(&[0x02])),
    )
}

fn client(mock: &MockModule, config: ClientConfig) -> PResult<Client> {
    pkcs11_logger::log_init(None);
    Client::with_module(mock.boxed(), "mock", config)
}

#[test]
#[serial]
fn discover_single_token() -> PResult<()> {
    let mock = signing_token();
    let client = client(&mock, ClientConfig::new("mock"))?;
    let tokens = client.list_tokens()?;
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].label, "signing token");
    assert!(tokens[0].login_required());
    Ok(())
}

#[test]
#[serial]
fn invalid_configuration_is_rejected_before_loading() {
    let mock = signing_token();
    let mut config = ClientConfig::new("mock");
    config.chunk_size = 0;
    assert!(matches!(
        client(&mock, config),
        Err(PError::Configuration(_))
    ));

    let mut config = ClientConfig::new("mock");
    config.max_find_objects = 10_000_000_000;
    assert!(matches!(
        client(&mock, config),
        Err(PError::Configuration(_))
    ));
    assert_eq!(mock.total_calls(), 0);
}

#[test]
#[serial]
fn chunked_signature_equals_single_shot() -> PResult<()> {
    let mock = signing_token();
    let client = client(&mock, ClientConfig::new("mock"))?;
    let token = SlotSelector::label("signing token");
    let pin = Credential::user(PIN);
    let data = (0..10 * 1024 * 1024_u32)
        .map(|i| (i % 251) as u8)
        .collect::<Vec<_>>();

    let streamed = client.sign_with_key(
        &token,
        Some(&pin),
        "rsa-2048",
        Some(&Mechanism::Sha256RsaPkcs),
        Cursor::new(&data),
    )?;
    assert_eq!(mock.count(NativeFunction::SignUpdate), data.len() / DEFAULT_CHUNK_SIZE);
    assert_eq!(mock.count(NativeFunction::SignFinal), 1);

    let mut session = client.open_session(&token, Some(&pin), AccessMode::ReadOnly)?;
    let mut key = session.resolve_unique("rsa-2048", ObjectClass::PrivateKey)?;
    let single_shot = session.sign_once(&mut key, &Mechanism::Sha256RsaPkcs, &data)?;
    session.close()?;

    assert_eq!(streamed, single_shot);
    assert_eq!(mock.count(NativeFunction::Sign), 1);
    Ok(())
}

#[test]
#[serial]
fn parallel_sessions_sign_independently() -> PResult<()> {
    let mock = signing_token();
    let client = client(&mock, ClientConfig::new("mock"))?;
    let token = SlotSelector::label("signing token");
    let pin = Credential::user(PIN);
    mock.set_latency(NativeFunction::SignUpdate, Duration::from_millis(20));

    let inputs = [
        ("rsa-2048", Mechanism::Sha256RsaPkcs, vec![0x11_u8; 3 * DEFAULT_CHUNK_SIZE]),
        ("p-256", Mechanism::EcdsaSha256, vec![0x22_u8; 3 * DEFAULT_CHUNK_SIZE]),
    ];
    let mut jobs = Vec::new();
    for (label, mechanism, data) in &inputs {
        let mut session = client.open_session(&token, Some(&pin), AccessMode::ReadOnly)?;
        let key = session.resolve_unique(label, ObjectClass::PrivateKey)?;
        jobs.push((session, key, mechanism, data));
    }
    assert_eq!(mock.open_sessions(), 2);

    // both operations are initialized before either of them streams data
    let barrier = &Barrier::new(jobs.len());
    let signatures = thread::scope(|scope| {
        let handles = jobs
            .into_iter()
            .map(|(mut session, mut key, mechanism, data)| {
                scope.spawn(move || -> PResult<Vec<u8>> {
                    session.sign_init(&mut key, mechanism)?;
                    barrier.wait();
                    for chunk in data.chunks(DEFAULT_CHUNK_SIZE) {
                        session.sign_update(chunk)?;
                    }
                    let signature = session.sign_final()?;
                    session.close()?;
                    Ok(signature)
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect::<PResult<Vec<_>>>()
    })?;
    assert_eq!(mock.count(NativeFunction::SignInit), 2);
    assert_eq!(mock.count(NativeFunction::SignUpdate), 6);
    assert_eq!(mock.open_sessions(), 0);

    for ((label, mechanism, data), signature) in inputs.iter().zip(&signatures) {
        let sequential =
            client.sign_with_key(&token, Some(&pin), label, Some(mechanism), data.as_slice())?;
        assert_eq!(*signature, sequential);
    }
    assert_ne!(signatures[0], signatures[1]);
    Ok(())
}

#[test]
#[serial]
fn second_authenticate_is_a_no_op() -> PResult<()> {
    let mock = signing_token();
    let client = client(&mock, ClientConfig::new("mock"))?;
    let mut session = client.session_manager().open_session(
        &SlotSelector::Index(0),
        AccessMode::ReadOnly,
    )?;
    let pin = Credential::user(PIN);
    session.authenticate(&pin)?;
    session.authenticate(&pin)?;
    assert_eq!(mock.count(NativeFunction::Login), 1);
    assert!(session.is_authenticated());
    Ok(())
}

#[test]
#[serial]
fn abandoned_session_rejects_every_call() -> PResult<()> {
    let mock = signing_token();
    let mut config = ClientConfig::new("mock");
    config.session_timeout_ms = Some(10);
    let client = client(&mock, config)?;
    let mut session = client.open_session(
        &SlotSelector::Index(0),
        Some(&Credential::user(PIN)),
        AccessMode::ReadOnly,
    )?;
    let mut key = session.resolve_unique("p-256", ObjectClass::PrivateKey)?;

    mock.set_latency(NativeFunction::SignUpdate, Duration::from_millis(50));
    let result = session.sign(&mut key, &Mechanism::EcdsaSha256, &b"slow token"[..]);
    assert!(matches!(result, Err(PError::SessionTimeout { .. })));
    assert_eq!(session.state(), SessionState::Abandoned);

    mock.clear_calls();
    assert!(matches!(
        session.find_by_label("p-256", ObjectClass::PrivateKey),
        Err(PError::InvalidHandle { .. })
    ));
    assert!(matches!(
        session.sign_init(&mut key, &Mechanism::EcdsaSha256),
        Err(PError::InvalidHandle { .. })
    ));
    assert!(matches!(session.logout(), Err(PError::InvalidHandle { .. })));
    session.close()?;
    assert_eq!(mock.total_calls(), 0);
    assert_eq!(mock.open_sessions(), 0);
    Ok(())
}

#[test]
#[serial]
fn wrong_pin_then_locked_out() -> PResult<()> {
    let mock = MockModule::new().with_token(MockToken::new(1, "t").user_pin(PIN).max_retries(2));
    let client = client(&mock, ClientConfig::new("mock"))?;
    let token = SlotSelector::Index(0);
    let wrong = Credential::user("0000");

    assert!(matches!(
        client.list_signing_keys(&token, Some(&wrong)),
        Err(PError::AuthenticationFailed { .. })
    ));
    assert!(matches!(
        client.list_signing_keys(&token, Some(&wrong)),
        Err(PError::AuthenticationLockedOut { .. })
    ));
    // the right PIN does not help once the token is locked
    assert!(matches!(
        client.list_signing_keys(&token, Some(&Credential::user(PIN))),
        Err(PError::AuthenticationLockedOut { .. })
    ));
    assert!(client.list_tokens()?[0].user_pin_locked());
    assert_eq!(mock.open_sessions(), 0);
    Ok(())
}

#[test]
#[serial]
fn signing_keys_and_mechanism_checks() -> PResult<()> {
    let mock = signing_token();
    let client = client(&mock, ClientConfig::new("mock"))?;
    let token = SlotSelector::SlotId(3);
    let pin = Credential::user(PIN);

    let keys = client.list_signing_keys(&token, Some(&pin))?;
    let labels = keys.iter().map(|k| k.label.as_str()).collect::<Vec<_>>();
    assert_eq!(labels, ["rsa-2048", "p-256"]);
    assert_eq!(keys[0].id, "01");
    assert_eq!(keys[1].key_type, Some(KeyType::Ec));

    mock.clear_calls();
    assert!(matches!(
        client.sign_with_key(&token, Some(&pin), "p-256", Some(&Mechanism::Sha256RsaPkcsPss), &b"x"[..]),
        Err(PError::MechanismMismatch { .. })
    ));
    assert_eq!(mock.count(NativeFunction::SignInit), 0);
    assert_eq!(mock.open_sessions(), 0);
    Ok(())
}

#[test]
#[serial]
fn protected_authentication_path_login() -> PResult<()> {
    let mock = MockModule::new().with_token(
        MockToken::new(1, "pinpad")
            .protected_authentication_path(true)
            .object(MockObject::private_key("k", KeyType::Eddsa)),
    );
    let client = client(&mock, ClientConfig::new("mock"))?;
    let token = SlotSelector::label("pinpad");
    assert!(client.list_tokens()?[0].protected_authentication_path());
    let signature = client.sign_with_key(
        &token,
        Some(&Credential::ProtectedAuthenticationPath),
        "k",
        None,
        &b"document"[..],
    )?;
    assert_eq!(signature.len(), 32);
    Ok(())
}
