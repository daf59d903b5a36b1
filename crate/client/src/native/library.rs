#![allow(unsafe_code)]
#![allow(non_snake_case)]

use std::{ffi::c_void, path::Path, ptr};

use libloading::Library;
use pkcs11_sys::{
    CK_ATTRIBUTE, CK_ATTRIBUTE_TYPE, CK_C_CloseSession, CK_C_Finalize, CK_C_FindObjects,
    CK_C_FindObjectsFinal, CK_C_FindObjectsInit, CK_C_GetAttributeValue, CK_C_GetInfo,
    CK_C_GetMechanismList, CK_C_GetSlotList, CK_C_GetTokenInfo, CK_C_INITIALIZE_ARGS,
    CK_C_Initialize, CK_C_Login, CK_C_Logout, CK_C_OpenSession, CK_C_Sign, CK_C_SignFinal,
    CK_C_SignInit, CK_C_SignUpdate, CK_FALSE, CK_FLAGS, CK_INFO, CK_MECHANISM, CK_MECHANISM_TYPE,
    CK_OBJECT_HANDLE, CK_RSA_PKCS_PSS_PARAMS, CK_SESSION_HANDLE, CK_SLOT_ID, CK_TOKEN_INFO,
    CK_TRUE, CK_ULONG, CK_USER_TYPE, CK_UTF8CHAR_PTR, CK_VOID_PTR, CKF_OS_LOCKING_OK,
    CKR_ARGUMENTS_BAD, CKR_ATTRIBUTE_SENSITIVE, CKR_ATTRIBUTE_TYPE_INVALID,
    CKR_FUNCTION_NOT_SUPPORTED, CKR_OK,
};
use tracing::trace;
use zeroize::Zeroizing;

use super::{Attribute, NativeModule, RvResult};
use crate::{PResult, mechanism::Mechanism};

/// `CK_UNAVAILABLE_INFORMATION`, reported as the length of an attribute that cannot be read
const UNAVAILABLE_INFORMATION: CK_ULONG = CK_ULONG::MAX;

/// Call a function of the table; a non `CKR_OK` status is returned to the caller
macro_rules! native_call {
    ($lib:expr, $function:ident $(, $arg:expr)* $(,)?) => {{
        trace!(concat!("calling ", stringify!($function)));
        let rv = match $lib.$function {
            Some(f) => unsafe { f($($arg),*) },
            None => CKR_FUNCTION_NOT_SUPPORTED,
        };
        if rv != CKR_OK {
            return Err(rv);
        }
    }};
}

fn ck_len(len: usize) -> RvResult<CK_ULONG> {
    CK_ULONG::try_from(len).map_err(|_| CKR_ARGUMENTS_BAD)
}

fn us_len(len: CK_ULONG) -> RvResult<usize> {
    usize::try_from(len).map_err(|_| CKR_ARGUMENTS_BAD)
}

/// A PKCS#11 shared library and the entry points resolved from it.
///
/// The library stays loaded as long as this struct lives. Initialization and
/// finalization are driven by the [`crate::Gateway`], not by loading or dropping.
pub struct Pkcs11Library {
    _library: Library,
    C_Initialize: CK_C_Initialize,
    C_Finalize: CK_C_Finalize,
    C_GetInfo: CK_C_GetInfo,
    C_GetSlotList: CK_C_GetSlotList,
    C_GetTokenInfo: CK_C_GetTokenInfo,
    C_GetMechanismList: CK_C_GetMechanismList,

    C_OpenSession: CK_C_OpenSession,
    C_CloseSession: CK_C_CloseSession,
    C_Login: CK_C_Login,
    C_Logout: CK_C_Logout,

    C_FindObjectsInit: CK_C_FindObjectsInit,
    C_FindObjects: CK_C_FindObjects,
    C_FindObjectsFinal: CK_C_FindObjectsFinal,
    C_GetAttributeValue: CK_C_GetAttributeValue,

    C_SignInit: CK_C_SignInit,
    C_SignUpdate: CK_C_SignUpdate,
    C_SignFinal: CK_C_SignFinal,
    C_Sign: CK_C_Sign,
}

impl Pkcs11Library {
    /// Load the shared library at `path` and resolve the entry points.
    ///
    /// A missing file, an incompatible binary or a missing symbol all fail with
    /// [`crate::PError::NativeLoad`].
    pub fn load(path: &Path) -> PResult<Self> {
        unsafe {
            let library = Library::new(path)?;
            Ok(Self {
                C_Initialize: Some(*library.get(b"C_Initialize")?),
                C_Finalize: Some(*library.get(b"C_Finalize")?),
                C_GetInfo: Some(*library.get(b"C_GetInfo")?),
                C_GetSlotList: Some(*library.get(b"C_GetSlotList")?),
                C_GetTokenInfo: Some(*library.get(b"C_GetTokenInfo")?),
                C_GetMechanismList: Some(*library.get(b"C_GetMechanismList")?),
                C_OpenSession: Some(*library.get(b"C_OpenSession")?),
                C_CloseSession: Some(*library.get(b"C_CloseSession")?),
                C_Login: Some(*library.get(b"C_Login")?),
                C_Logout: Some(*library.get(b"C_Logout")?),
                C_FindObjectsInit: Some(*library.get(b"C_FindObjectsInit")?),
                C_FindObjects: Some(*library.get(b"C_FindObjects")?),
                C_FindObjectsFinal: Some(*library.get(b"C_FindObjectsFinal")?),
                C_GetAttributeValue: Some(*library.get(b"C_GetAttributeValue")?),
                C_SignInit: Some(*library.get(b"C_SignInit")?),
                C_SignUpdate: Some(*library.get(b"C_SignUpdate")?),
                C_SignFinal: Some(*library.get(b"C_SignFinal")?),
                C_Sign: Some(*library.get(b"C_Sign")?),
                // we need to keep the library alive
                _library: library,
            })
        }
    }
}

impl NativeModule for Pkcs11Library {
    fn initialize(&self) -> RvResult<()> {
        let mut init_args = CK_C_INITIALIZE_ARGS {
            CreateMutex: None,
            DestroyMutex: None,
            LockMutex: None,
            UnlockMutex: None,
            flags: CKF_OS_LOCKING_OK,
            pReserved: ptr::null_mut(),
        };
        native_call!(
            self,
            C_Initialize,
            (&raw mut init_args).cast::<c_void>()
        );
        Ok(())
    }

    fn finalize(&self) -> RvResult<()> {
        native_call!(self, C_Finalize, ptr::null_mut());
        Ok(())
    }

    fn info(&self) -> RvResult<CK_INFO> {
        let mut info = CK_INFO::default();
        native_call!(self, C_GetInfo, &raw mut info);
        Ok(info)
    }

    fn slot_list(&self, token_present: bool) -> RvResult<Vec<CK_SLOT_ID>> {
        let present = if token_present { CK_TRUE } else { CK_FALSE };
        let mut count: CK_ULONG = 0;
        native_call!(self, C_GetSlotList, present, ptr::null_mut(), &raw mut count);
        let mut slots = vec![CK_SLOT_ID::default(); us_len(count)?];
        native_call!(
            self,
            C_GetSlotList,
            present,
            slots.as_mut_ptr(),
            &raw mut count
        );
        slots.truncate(us_len(count)?);
        Ok(slots)
    }

    fn token_info(&self, slot: CK_SLOT_ID) -> RvResult<CK_TOKEN_INFO> {
        let mut info = CK_TOKEN_INFO::default();
        native_call!(self, C_GetTokenInfo, slot, &raw mut info);
        Ok(info)
    }

    fn mechanism_list(&self, slot: CK_SLOT_ID) -> RvResult<Vec<CK_MECHANISM_TYPE>> {
        let mut count: CK_ULONG = 0;
        native_call!(self, C_GetMechanismList, slot, ptr::null_mut(), &raw mut count);
        let mut mechanisms = vec![CK_MECHANISM_TYPE::default(); us_len(count)?];
        native_call!(
            self,
            C_GetMechanismList,
            slot,
            mechanisms.as_mut_ptr(),
            &raw mut count
        );
        mechanisms.truncate(us_len(count)?);
        Ok(mechanisms)
    }

    fn open_session(&self, slot: CK_SLOT_ID, flags: CK_FLAGS) -> RvResult<CK_SESSION_HANDLE> {
        let mut session: CK_SESSION_HANDLE = 0;
        native_call!(
            self,
            C_OpenSession,
            slot,
            flags,
            ptr::null_mut(),
            None,
            &raw mut session
        );
        Ok(session)
    }

    fn close_session(&self, session: CK_SESSION_HANDLE) -> RvResult<()> {
        native_call!(self, C_CloseSession, session);
        Ok(())
    }

    fn login(
        &self,
        session: CK_SESSION_HANDLE,
        user_type: CK_USER_TYPE,
        pin: Option<&[u8]>,
    ) -> RvResult<()> {
        // the module takes a mutable pointer; hand it a scratch copy wiped on drop
        let mut pin = pin.map(|p| Zeroizing::new(p.to_vec()));
        let (pin_ptr, pin_len): (CK_UTF8CHAR_PTR, CK_ULONG) = match pin.as_mut() {
            Some(p) => (p.as_mut_ptr(), ck_len(p.len())?),
            None => (ptr::null_mut(), 0),
        };
        native_call!(self, C_Login, session, user_type, pin_ptr, pin_len);
        Ok(())
    }

    fn logout(&self, session: CK_SESSION_HANDLE) -> RvResult<()> {
        native_call!(self, C_Logout, session);
        Ok(())
    }

    fn find_objects_init(
        &self,
        session: CK_SESSION_HANDLE,
        template: &[Attribute],
    ) -> RvResult<()> {
        let mut native_template = template
            .iter()
            .map(|attribute| {
                Ok(CK_ATTRIBUTE {
                    type_: attribute.kind,
                    pValue: attribute.value.as_ptr().cast_mut().cast::<c_void>(),
                    ulValueLen: ck_len(attribute.value.len())?,
                })
            })
            .collect::<RvResult<Vec<_>>>()?;
        native_call!(
            self,
            C_FindObjectsInit,
            session,
            native_template.as_mut_ptr(),
            ck_len(native_template.len())?
        );
        Ok(())
    }

    fn find_objects(
        &self,
        session: CK_SESSION_HANDLE,
        max_count: CK_ULONG,
    ) -> RvResult<Vec<CK_OBJECT_HANDLE>> {
        let mut handles = vec![CK_OBJECT_HANDLE::default(); us_len(max_count)?];
        let mut count: CK_ULONG = 0;
        native_call!(
            self,
            C_FindObjects,
            session,
            handles.as_mut_ptr(),
            max_count,
            &raw mut count
        );
        if count > max_count {
            return Err(CKR_ARGUMENTS_BAD);
        }
        handles.truncate(us_len(count)?);
        Ok(handles)
    }

    fn find_objects_final(&self, session: CK_SESSION_HANDLE) -> RvResult<()> {
        native_call!(self, C_FindObjectsFinal, session);
        Ok(())
    }

    fn attribute_values(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        kinds: &[CK_ATTRIBUTE_TYPE],
    ) -> RvResult<Vec<Option<Vec<u8>>>> {
        let Some(get_attribute_value) = self.C_GetAttributeValue else {
            return Err(CKR_FUNCTION_NOT_SUPPORTED);
        };

        // first pass: lengths only
        let mut template = kinds
            .iter()
            .map(|kind| CK_ATTRIBUTE {
                type_: *kind,
                pValue: ptr::null_mut(),
                ulValueLen: 0,
            })
            .collect::<Vec<_>>();
        trace!("calling C_GetAttributeValue for {} attributes", kinds.len());
        let rv = unsafe {
            get_attribute_value(
                session,
                object,
                template.as_mut_ptr(),
                ck_len(template.len())?,
            )
        };
        if rv != CKR_OK && rv != CKR_ATTRIBUTE_SENSITIVE && rv != CKR_ATTRIBUTE_TYPE_INVALID {
            return Err(rv);
        }

        let mut buffers = template
            .iter()
            .map(|attribute| {
                if attribute.ulValueLen == UNAVAILABLE_INFORMATION {
                    Ok(None)
                } else {
                    Ok(Some(vec![0_u8; us_len(attribute.ulValueLen)?]))
                }
            })
            .collect::<RvResult<Vec<_>>>()?;

        // second pass: only the readable attributes, with buffers of the reported size
        let mut readable = template
            .iter()
            .zip(buffers.iter_mut())
            .filter_map(|(attribute, buffer)| {
                buffer.as_mut().map(|b| CK_ATTRIBUTE {
                    type_: attribute.type_,
                    pValue: b.as_mut_ptr().cast::<c_void>(),
                    ulValueLen: attribute.ulValueLen,
                })
            })
            .collect::<Vec<_>>();
        if !readable.is_empty() {
            let rv = unsafe {
                get_attribute_value(
                    session,
                    object,
                    readable.as_mut_ptr(),
                    ck_len(readable.len())?,
                )
            };
            if rv != CKR_OK {
                return Err(rv);
            }
        }
        Ok(buffers)
    }

    fn sign_init(
        &self,
        session: CK_SESSION_HANDLE,
        mechanism: &Mechanism,
        key: CK_OBJECT_HANDLE,
    ) -> RvResult<()> {
        // the parameter buffers must outlive the call
        let mut pss = mechanism.pss_params();
        let mut custom = mechanism.raw_parameter().map(<[u8]>::to_vec);
        let (parameter, parameter_len): (CK_VOID_PTR, usize) = if let Some(p) = pss.as_mut() {
            (
                (&raw mut *p).cast::<c_void>(),
                size_of::<CK_RSA_PKCS_PSS_PARAMS>(),
            )
        } else if let Some(c) = custom.as_mut() {
            (c.as_mut_ptr().cast::<c_void>(), c.len())
        } else {
            (ptr::null_mut(), 0)
        };
        let mut native_mechanism = CK_MECHANISM {
            mechanism: mechanism.mechanism_type(),
            pParameter: parameter,
            ulParameterLen: ck_len(parameter_len)?,
        };
        native_call!(self, C_SignInit, session, &raw mut native_mechanism, key);
        Ok(())
    }

    fn sign_update(&self, session: CK_SESSION_HANDLE, data: &[u8]) -> RvResult<()> {
        native_call!(
            self,
            C_SignUpdate,
            session,
            data.as_ptr().cast_mut(),
            ck_len(data.len())?
        );
        Ok(())
    }

    fn sign_final(&self, session: CK_SESSION_HANDLE) -> RvResult<Vec<u8>> {
        let mut len: CK_ULONG = 0;
        native_call!(self, C_SignFinal, session, ptr::null_mut(), &raw mut len);
        let mut signature = vec![0_u8; us_len(len)?];
        native_call!(
            self,
            C_SignFinal,
            session,
            signature.as_mut_ptr(),
            &raw mut len
        );
        signature.truncate(us_len(len)?);
        Ok(signature)
    }

    fn sign(&self, session: CK_SESSION_HANDLE, data: &[u8]) -> RvResult<Vec<u8>> {
        let data_len = ck_len(data.len())?;
        let mut len: CK_ULONG = 0;
        native_call!(
            self,
            C_Sign,
            session,
            data.as_ptr().cast_mut(),
            data_len,
            ptr::null_mut(),
            &raw mut len
        );
        let mut signature = vec![0_u8; us_len(len)?];
        native_call!(
            self,
            C_Sign,
            session,
            data.as_ptr().cast_mut(),
            data_len,
            signature.as_mut_ptr(),
            &raw mut len
        );
        signature.truncate(us_len(len)?);
        Ok(signature)
    }
}
