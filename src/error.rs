//! Error taxonomy: wire-stable codes (spec §6/§7) plus the internal
//! `ContractViolation` class and the provider error passthrough.

use std::fmt;

// ---------------------------------------------------------------------------
// Provider error (opaque CRYPTO PROVIDER failure taxonomy)
// ---------------------------------------------------------------------------

/// Failures reported by the narrow capability surface the core consumes
/// from the CRYPTO PROVIDER (allocate/set-key/cipher/AE/MAC/random). The
/// provider's internals are out of scope; this is the shape its failures
/// take once they cross into the core.
#[derive(Debug)]
pub enum ProviderError {
    /// Transient-object or operation-handle allocation failed.
    OutOfMemory,
    /// Key material was rejected when populating the transient object.
    KeyPopulationFailed,
    /// A cipher/AE/MAC step failed for a reason not covered below.
    OperationFailed(String),
    /// AE tag verification failed on decrypt-final.
    AuthenticationFailed,
    /// The provider reported a larger output buffer is required.
    ShortBuffer { need: usize },
    /// Secure random source is unavailable.
    RandomUnavailable,
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "provider: out of memory"),
            Self::KeyPopulationFailed => write!(f, "provider: key population failed"),
            Self::OperationFailed(msg) => write!(f, "provider: operation failed: {}", msg),
            Self::AuthenticationFailed => write!(f, "provider: authentication failed"),
            Self::ShortBuffer { need } => write!(f, "provider: short buffer, need {}", need),
            Self::RandomUnavailable => write!(f, "provider: random source unavailable"),
        }
    }
}

impl std::error::Error for ProviderError {}

// ---------------------------------------------------------------------------
// Core error
// ---------------------------------------------------------------------------

/// Wire-stable error taxonomy (spec §6 "Error codes", §7 "Error handling
/// design"). One enum covers every component: cipher/sign/verify/object
/// store/policy gate all share this code space on the wire.
#[derive(Debug)]
pub enum CoreError {
    GeneralError,
    BadParam,
    ShortBuffer { need: usize },
    OutOfMemory,
    NotFound,

    SessionHandleInvalid,
    KeyHandleInvalid,
    HandleInvalid,
    OperationActive,
    OperationNotInitialized,
    MechanismInvalid,
    MechanismParamInvalid,
    KeyTypeInconsistent,
    KeyFunctionNotPermitted,
    AttributeTypeInvalid,
    AttributeValueInvalid,
    TemplateInconsistent,
    UserNotLoggedIn,
    SessionReadOnly,
    ActionProhibited,
    SignatureInvalid,

    /// Internal invariant broken (unmapped boolean attribute, reentrant
    /// op-alloc while one exists, class-lookup on a malformed blob). Fatal:
    /// the session that hit this must be aborted, never retried.
    ContractViolation(&'static str),

    /// A provider-reported failure, translated through `map_provider_error`.
    Provider(ProviderError),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GeneralError => write!(f, "general error"),
            Self::BadParam => write!(f, "bad parameter"),
            Self::ShortBuffer { need } => write!(f, "short buffer, need {} bytes", need),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::NotFound => write!(f, "not found"),
            Self::SessionHandleInvalid => write!(f, "session handle invalid"),
            Self::KeyHandleInvalid => write!(f, "key handle invalid"),
            Self::HandleInvalid => write!(f, "handle invalid"),
            Self::OperationActive => write!(f, "operation active"),
            Self::OperationNotInitialized => write!(f, "operation not initialized"),
            Self::MechanismInvalid => write!(f, "mechanism invalid"),
            Self::MechanismParamInvalid => write!(f, "mechanism parameter invalid"),
            Self::KeyTypeInconsistent => write!(f, "key type inconsistent"),
            Self::KeyFunctionNotPermitted => write!(f, "key function not permitted"),
            Self::AttributeTypeInvalid => write!(f, "attribute type invalid"),
            Self::AttributeValueInvalid => write!(f, "attribute value invalid"),
            Self::TemplateInconsistent => write!(f, "template inconsistent"),
            Self::UserNotLoggedIn => write!(f, "user not logged in"),
            Self::SessionReadOnly => write!(f, "session read only"),
            Self::ActionProhibited => write!(f, "action prohibited"),
            Self::SignatureInvalid => write!(f, "signature invalid"),
            Self::ContractViolation(what) => write!(f, "contract violation: {}", what),
            Self::Provider(e) => write!(f, "provider error: {}", e),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<ProviderError> for CoreError {
    fn from(e: ProviderError) -> Self {
        map_provider_error(e)
    }
}

/// The single standard mapping from a provider failure to a core error.
/// Resolves Open Question (c): every provider failure path, including
/// transient-object allocation failure, funnels through here — there is no
/// second ad-hoc mapping at any call site.
pub fn map_provider_error(err: ProviderError) -> CoreError {
    match err {
        ProviderError::OutOfMemory => CoreError::OutOfMemory,
        ProviderError::KeyPopulationFailed => CoreError::GeneralError,
        ProviderError::OperationFailed(_) => CoreError::GeneralError,
        ProviderError::AuthenticationFailed => CoreError::GeneralError,
        ProviderError::ShortBuffer { need } => CoreError::ShortBuffer { need },
        ProviderError::RandomUnavailable => CoreError::GeneralError,
    }
}
