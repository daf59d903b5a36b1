//! Object Catalog
//!
//! Attribute-template searches within a session, and resolution of a label to a
//! single object. Object references are bound to the session that found them and are
//! never cached: they become invalid when that session closes.

use std::time::Instant;

use pkcs11_sys::{
    CK_ATTRIBUTE_TYPE, CK_OBJECT_HANDLE, CKA_CLASS, CKA_ID, CKA_KEY_TYPE, CKA_LABEL, CKA_SIGN,
    CKA_VALUE,
};

use super::Session;
use crate::{
    PError, PResult,
    gateway::AttributeMap,
    native::{Attribute, decode_ulong},
    pkcs11_error,
    types::{KeyInfo, KeyType, ObjectClass},
};

/// A certificate or key located through a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    session_serial: u64,
    handle: CK_OBJECT_HANDLE,
    class: Option<ObjectClass>,
    key_type: Option<KeyType>,
}

impl ObjectRef {
    #[must_use]
    pub const fn handle(&self) -> CK_OBJECT_HANDLE {
        self.handle
    }

    /// The class, when the search constrained it
    #[must_use]
    pub const fn class(&self) -> Option<ObjectClass> {
        self.class
    }

    /// The key type, when the search constrained it or it was read with
    /// [`Session::load_key_type`]
    #[must_use]
    pub const fn key_type(&self) -> Option<KeyType> {
        self.key_type
    }
}

/// A search template
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectQuery {
    class: Option<ObjectClass>,
    label: Option<String>,
    id: Option<Vec<u8>>,
    key_type: Option<KeyType>,
    can_sign: Option<bool>,
}

impl ObjectQuery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn class(mut self, class: ObjectClass) -> Self {
        self.class = Some(class);
        self
    }

    #[must_use]
    pub fn label(mut self, label: &str) -> Self {
        self.label = Some(label.to_owned());
        self
    }

    #[must_use]
    pub fn id(mut self, id: &[u8]) -> Self {
        self.id = Some(id.to_vec());
        self
    }

    #[must_use]
    pub const fn key_type(mut self, key_type: KeyType) -> Self {
        self.key_type = Some(key_type);
        self
    }

    #[must_use]
    pub const fn can_sign(mut self, can_sign: bool) -> Self {
        self.can_sign = Some(can_sign);
        self
    }

    fn template(&self) -> Vec<Attribute> {
        let mut template = Vec::with_capacity(5);
        if let Some(class) = self.class {
            template.push(Attribute::class(class));
        }
        if let Some(label) = &self.label {
            template.push(Attribute::label(label));
        }
        if let Some(id) = &self.id {
            template.push(Attribute::id(id));
        }
        if let Some(key_type) = self.key_type {
            template.push(Attribute::key_type(key_type));
        }
        if let Some(can_sign) = self.can_sign {
            template.push(Attribute::bool(CKA_SIGN, can_sign));
        }
        template
    }
}

impl Session {
    /// All objects matching the query; an empty result is not an error
    pub fn find(&mut self, query: &ObjectQuery) -> PResult<Vec<ObjectRef>> {
        self.ensure_usable("C_FindObjectsInit")?;
        self.ensure_idle()?;
        self.options.check_max_find_objects()?;
        let started = Instant::now();
        let result = self.gateway().find_objects(
            self.handle(),
            &query.template(),
            self.options.max_find_objects,
        );
        let handles = self.finish(started, "C_FindObjects", result)?;
        Ok(handles
            .into_iter()
            .map(|handle| ObjectRef {
                session_serial: self.serial(),
                handle,
                class: query.class,
                key_type: query.key_type,
            })
            .collect())
    }

    pub fn find_by_label(&mut self, label: &str, class: ObjectClass) -> PResult<Vec<ObjectRef>> {
        self.find(&ObjectQuery::new().class(class).label(label))
    }

    /// Exactly one object with this label and class.
    ///
    /// Fails with [`PError::KeyNotFound`] when nothing matches and with
    /// [`PError::AmbiguousKey`] when several objects do. Only the search is sent to the
    /// module: no attribute is read.
    pub fn resolve_unique(&mut self, label: &str, class: ObjectClass) -> PResult<ObjectRef> {
        let mut found = self.find_by_label(label, class)?;
        match found.len() {
            0 => Err(PError::KeyNotFound(format!(
                "no {class} labelled '{label}' on token '{}'",
                self.token().label
            ))),
            1 => found.pop().ok_or_else(|| PError::KeyNotFound(label.to_owned())),
            count => Err(PError::AmbiguousKey {
                label: label.to_owned(),
                count,
            }),
        }
    }

    pub(super) fn ensure_owned(&self, object: &ObjectRef, operation: &'static str) -> PResult<()> {
        if object.session_serial == self.serial() {
            Ok(())
        } else {
            Err(PError::InvalidHandle {
                operation,
                reason: format!(
                    "object {} was found through another session",
                    object.handle
                ),
            })
        }
    }

    /// Raw attribute values; attributes that are sensitive or absent are left out
    pub fn read_attributes(
        &mut self,
        object: &ObjectRef,
        kinds: &[CK_ATTRIBUTE_TYPE],
    ) -> PResult<AttributeMap> {
        self.ensure_usable("C_GetAttributeValue")?;
        self.ensure_owned(object, "C_GetAttributeValue")?;
        self.ensure_idle()?;
        let started = Instant::now();
        let result = self
            .gateway()
            .attribute_values(self.handle(), object.handle, kinds);
        self.finish(started, "C_GetAttributeValue", result)
    }

    /// Read `CKA_KEY_TYPE` and remember it on the reference
    pub fn load_key_type(&mut self, key: &mut ObjectRef) -> PResult<Option<KeyType>> {
        if key.key_type.is_none() {
            let attributes = self.read_attributes(key, &[CKA_KEY_TYPE])?;
            key.key_type = attributes
                .get(&CKA_KEY_TYPE)
                .and_then(|v| decode_ulong(v))
                .and_then(KeyType::from_ck_key_type);
        }
        Ok(key.key_type)
    }

    /// Private keys allowed to sign
    pub fn list_signing_keys(&mut self) -> PResult<Vec<KeyInfo>> {
        let keys = self.find(
            &ObjectQuery::new()
                .class(ObjectClass::PrivateKey)
                .can_sign(true),
        )?;
        let mut infos = Vec::with_capacity(keys.len());
        for key in &keys {
            let attributes =
                self.read_attributes(key, &[CKA_CLASS, CKA_LABEL, CKA_ID, CKA_KEY_TYPE])?;
            let label = attributes
                .get(&CKA_LABEL)
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .unwrap_or_default();
            let id = attributes.get(&CKA_ID).map(hex::encode).unwrap_or_default();
            let key_type = attributes
                .get(&CKA_KEY_TYPE)
                .and_then(|v| decode_ulong(v))
                .and_then(KeyType::from_ck_key_type);
            let class = attributes
                .get(&CKA_CLASS)
                .and_then(|v| decode_ulong(v))
                .and_then(ObjectClass::from_ck_object_class)
                .unwrap_or(ObjectClass::PrivateKey);
            infos.push(KeyInfo {
                label,
                id,
                key_type,
                class,
            });
        }
        Ok(infos)
    }

    /// DER encoding of the certificate with this label
    pub fn read_certificate(&mut self, label: &str) -> PResult<Vec<u8>> {
        let certificate = self.resolve_unique(label, ObjectClass::Certificate)?;
        let mut attributes = self.read_attributes(&certificate, &[CKA_VALUE])?;
        attributes
            .remove(&CKA_VALUE)
            .ok_or_else(|| pkcs11_error!("the certificate '{label}' has no readable value"))
    }
}
