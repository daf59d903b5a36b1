//! Session Manager
//!
//! Token discovery and session opening. Tokens are listed in native enumeration
//! order and selected with a [`SlotSelector`].

use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
    sync::Arc,
};

use pkcs11_sys::CK_MECHANISM_TYPE;
use tracing::{debug, warn};

use crate::{
    PError, PResult,
    gateway::Gateway,
    session::{Session, SessionOptions},
    types::{AccessMode, SlotId, TokenInfo},
};

/// How a caller designates a token.
///
/// Textual forms: `slot:<id>` (native slot id), `index:<n>` or a bare number (position
/// in the discovery order), `label:<label>[#<n>]` or a bare label. The `#<n>` suffix
/// picks the n-th token (from 0) among those sharing the label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotSelector {
    Index(usize),
    SlotId(SlotId),
    Label { label: String, index: Option<usize> },
}

impl SlotSelector {
    pub fn label(label: impl Into<String>) -> Self {
        Self::Label {
            label: label.into(),
            index: None,
        }
    }
}

impl Display for SlotSelector {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(index) => write!(f, "index:{index}"),
            Self::SlotId(slot) => write!(f, "slot:{slot}"),
            Self::Label {
                label,
                index: None,
            } => write!(f, "label:{label}"),
            Self::Label {
                label,
                index: Some(index),
            } => write!(f, "label:{label}#{index}"),
        }
    }
}

impl FromStr for SlotSelector {
    type Err = PError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |e: std::num::ParseIntError| {
            PError::Configuration(format!("invalid token selector '{s}': {e}"))
        };
        if let Some(slot) = s.strip_prefix("slot:") {
            return Ok(Self::SlotId(slot.parse().map_err(invalid)?));
        }
        if let Some(index) = s.strip_prefix("index:") {
            return Ok(Self::Index(index.parse().map_err(invalid)?));
        }
        if let Some(label) = s.strip_prefix("label:") {
            return Ok(match label.rsplit_once('#') {
                Some((label, index)) => Self::Label {
                    label: label.to_owned(),
                    index: Some(index.parse().map_err(invalid)?),
                },
                None => Self::label(label),
            });
        }
        if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(Self::Index(s.parse().map_err(invalid)?));
        }
        if s.is_empty() {
            return Err(PError::Configuration("empty token selector".to_owned()));
        }
        Ok(Self::label(s))
    }
}

pub struct SessionManager {
    gateway: Arc<Gateway>,
    options: SessionOptions,
}

impl SessionManager {
    #[must_use]
    pub const fn new(gateway: Arc<Gateway>, options: SessionOptions) -> Self {
        Self { gateway, options }
    }

    #[must_use]
    pub const fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    #[must_use]
    pub const fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn list_slots(&self, token_present: bool) -> PResult<Vec<SlotId>> {
        self.gateway.list_slots(token_present)
    }

    /// Tokens present, in native enumeration order.
    ///
    /// A token removed between the slot enumeration and the token query is skipped.
    pub fn discover_tokens(&self) -> PResult<Vec<TokenInfo>> {
        let slots = self.gateway.list_slots(true)?;
        let mut tokens = Vec::with_capacity(slots.len());
        for slot in slots {
            match self.gateway.token_info(slot) {
                Ok(token) => tokens.push(token),
                Err(PError::TokenNotFound(reason)) => {
                    warn!("skipping slot {slot}: {reason}");
                }
                Err(e) => return Err(e),
            }
        }
        debug!("discovered {} tokens", tokens.len());
        Ok(tokens)
    }

    /// The token designated by `selector`
    pub fn resolve(&self, selector: &SlotSelector) -> PResult<TokenInfo> {
        let tokens = self.discover_tokens()?;
        match selector {
            SlotSelector::Index(index) => tokens.into_iter().nth(*index).ok_or_else(|| {
                PError::TokenNotFound(format!("no token at index {index}"))
            }),
            SlotSelector::SlotId(slot) => tokens
                .into_iter()
                .find(|t| t.slot_id == *slot)
                .ok_or_else(|| PError::TokenNotFound(format!("no token in slot {slot}"))),
            SlotSelector::Label { label, index } => {
                let mut matching = tokens
                    .into_iter()
                    .filter(|t| t.label == *label)
                    .collect::<Vec<_>>();
                match (matching.len(), index) {
                    (0, _) => Err(PError::TokenNotFound(format!(
                        "no token labelled '{label}'"
                    ))),
                    (1, None) => matching
                        .pop()
                        .ok_or_else(|| PError::TokenNotFound(label.clone())),
                    (count, None) => Err(PError::AmbiguousSelector(format!(
                        "{count} tokens are labelled '{label}'; use label:{label}#<n> to pick one"
                    ))),
                    (count, Some(n)) => {
                        if *n < count {
                            Ok(matching.swap_remove(*n))
                        } else {
                            Err(PError::TokenNotFound(format!(
                                "only {count} tokens are labelled '{label}', no #{n}"
                            )))
                        }
                    }
                }
            }
        }
    }

    /// Open a session on the designated token
    pub fn open_session(&self, selector: &SlotSelector, mode: AccessMode) -> PResult<Session> {
        let token = self.resolve(selector)?;
        self.open_session_on(token, mode)
    }

    pub fn open_session_on(&self, token: TokenInfo, mode: AccessMode) -> PResult<Session> {
        let handle = self.gateway.open_session(token.slot_id, mode)?;
        Ok(Session::new(
            self.gateway.clone(),
            handle,
            token,
            mode,
            self.options.clone(),
        ))
    }

    /// Mechanisms advertised by the designated token
    pub fn mechanisms(&self, selector: &SlotSelector) -> PResult<Vec<CK_MECHANISM_TYPE>> {
        let token = self.resolve(selector)?;
        self.gateway.mechanism_list(token.slot_id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::{
        sync::{Arc, Barrier},
        thread,
        time::Duration,
    };

    use pkcs11_sys::CKR_TOKEN_NOT_PRESENT;
    use serial_test::serial;

    use super::{SessionManager, SlotSelector};
    use crate::{
        AccessMode, PError, SessionOptions,
        gateway::Gateway,
        mock::{MockModule, MockToken, NativeFunction},
    };

    #[test]
    fn test_selector_parsing() {
        assert_eq!("slot:12".parse::<SlotSelector>().unwrap(), SlotSelector::SlotId(12));
        assert_eq!("index:1".parse::<SlotSelector>().unwrap(), SlotSelector::Index(1));
        assert_eq!("2".parse::<SlotSelector>().unwrap(), SlotSelector::Index(2));
        assert_eq!(
            "label:signing#1".parse::<SlotSelector>().unwrap(),
            SlotSelector::Label {
                label: "signing".to_owned(),
                index: Some(1)
            }
        );
        assert_eq!(
            "my token".parse::<SlotSelector>().unwrap(),
            SlotSelector::label("my token")
        );
        assert_eq!(
            "label:1234".parse::<SlotSelector>().unwrap(),
            SlotSelector::label("1234")
        );
        assert!("slot:abc".parse::<SlotSelector>().is_err());
        assert!("".parse::<SlotSelector>().is_err());
        assert_eq!(SlotSelector::SlotId(4).to_string(), "slot:4");
    }

    #[test]
    #[serial]
    fn test_discover_single_token() {
        let mock = MockModule::new().with_token(MockToken::new(7, "signing token"));
        let gateway = Gateway::initialize_with(mock.boxed(), "mock").unwrap();
        let manager = SessionManager::new(gateway, SessionOptions::default());
        let tokens = manager.discover_tokens().unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].label, "signing token");
        assert_eq!(tokens[0].slot_id, 7);
    }

    #[test]
    #[serial]
    fn test_selectors_against_tokens() {
        let mock = MockModule::new()
            .with_token(MockToken::new(1, "alpha"))
            .with_token(MockToken::new(2, "twin"))
            .with_token(MockToken::new(3, "twin"))
            .with_token(MockToken::new(4, "absent").present(false));
        let gateway = Gateway::initialize_with(mock.boxed(), "mock").unwrap();
        let manager = SessionManager::new(gateway, SessionOptions::default());

        assert_eq!(manager.list_slots(false).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(manager.list_slots(true).unwrap(), vec![1, 2, 3]);
        assert_eq!(manager.resolve(&SlotSelector::Index(1)).unwrap().slot_id, 2);
        assert_eq!(manager.resolve(&SlotSelector::SlotId(3)).unwrap().slot_id, 3);
        assert_eq!(
            manager.resolve(&SlotSelector::label("alpha")).unwrap().slot_id,
            1
        );
        assert!(matches!(
            manager.resolve(&SlotSelector::label("twin")),
            Err(PError::AmbiguousSelector(_))
        ));
        let second_twin = SlotSelector::Label {
            label: "twin".to_owned(),
            index: Some(1),
        };
        assert_eq!(manager.resolve(&second_twin).unwrap().slot_id, 3);
        assert!(matches!(
            manager.resolve(&SlotSelector::label("absent")),
            Err(PError::TokenNotFound(_))
        ));
        assert!(matches!(
            manager.resolve(&SlotSelector::Index(9)),
            Err(PError::TokenNotFound(_))
        ));
        assert!(matches!(
            manager.open_session(&SlotSelector::SlotId(4), AccessMode::ReadOnly),
            Err(PError::TokenNotFound(_))
        ));
        assert_eq!(mock.count(NativeFunction::OpenSession), 0);
    }

    #[test]
    #[serial]
    fn test_vanished_token_is_skipped() {
        let mock = MockModule::new()
            .with_token(MockToken::new(1, "alpha"))
            .with_token(MockToken::new(2, "beta"));
        let gateway = Gateway::initialize_with(mock.boxed(), "mock").unwrap();
        let manager = SessionManager::new(gateway, SessionOptions::default());

        // the token is pulled out between C_GetSlotList and C_GetTokenInfo
        mock.fail_next(NativeFunction::GetTokenInfo, CKR_TOKEN_NOT_PRESENT);
        let tokens = manager.discover_tokens().unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].label, "beta");
    }

    #[test]
    #[serial]
    fn test_concurrent_initialization_is_serialized() {
        let mock = MockModule::new().with_token(MockToken::new(1, "alpha"));
        mock.set_latency(NativeFunction::Initialize, Duration::from_millis(20));
        let barrier = &Barrier::new(8);
        let module = &mock;
        let results = thread::scope(|scope| {
            let handles = (0..8)
                .map(move |_| {
                    scope.spawn(move || {
                        barrier.wait();
                        Gateway::initialize_with(module.boxed(), "mock")
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect::<Vec<_>>()
        });
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(
            results
                .iter()
                .filter_map(|r| r.as_ref().err())
                .all(|e| matches!(e, PError::AlreadyInitialized))
        );
        assert_eq!(mock.count(NativeFunction::Initialize), 1);

        // once the winner is gone, the module can be initialized again
        drop(results);
        let gateway = Gateway::initialize_with(mock.boxed(), "mock").unwrap();
        gateway.finalize().unwrap();
    }

    #[test]
    #[serial]
    fn test_concurrent_discovery() {
        let mock = MockModule::new()
            .with_token(MockToken::new(1, "alpha"))
            .with_token(MockToken::new(2, "beta"));
        mock.set_latency(NativeFunction::GetTokenInfo, Duration::from_millis(5));
        let gateway = Gateway::initialize_with(mock.boxed(), "mock").unwrap();
        let manager = Arc::new(SessionManager::new(gateway, SessionOptions::default()));
        let expected = manager.discover_tokens().unwrap();

        let handles = (0..6)
            .map(|_| {
                let manager = manager.clone();
                thread::spawn(move || manager.discover_tokens())
            })
            .collect::<Vec<_>>();
        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap(), expected);
        }
        assert_eq!(mock.count(NativeFunction::GetTokenInfo), 7 * expected.len());
    }
}
