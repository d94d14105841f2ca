use thiserror::Error;

/// Problems found while validating the entity catalog at startup.
///
/// Any of these is fatal: the process must not start with a catalog that
/// cannot be walked in dependency order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("catalog is empty")]
    Empty,

    #[error("entity '{0}' declared more than once")]
    DuplicateEntity(String),

    #[error("entity '{entity}' names unknown parent '{parent}'")]
    UnknownParent { entity: String, parent: String },

    #[error("entity '{entity}' names parent '{parent}' which is declared later")]
    ParentDeclaredLater { entity: String, parent: String },

    #[error("entity '{0}' names itself as parent")]
    SelfParent(String),

    #[error("invalid identifier '{0}' (expected [a-z_][a-z0-9_]*)")]
    InvalidIdentifier(String),

    #[error("catalog parse error: {0}")]
    Parse(String),
}

/// Rejections raised while shape-checking a caller-supplied snapshot.
/// Always raised before any destructive action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("payload is not valid JSON: {0}")]
    MalformedJson(String),

    #[error("payload must be a JSON object")]
    NotAnObject,

    #[error("payload has no top-level 'tables' map")]
    MissingTables,

    #[error("table '{0}' must be an array of row objects")]
    BadTable(String),

    #[error("snapshot belongs to tenant '{found}', not '{expected}'")]
    TenantMismatch { expected: String, found: String },

    #[error("snapshot schema version {found} is newer than supported version {supported}")]
    UnsupportedSchemaVersion { found: u32, supported: u32 },

    #[error("invalid archive key component '{0}'")]
    BadKeyComponent(String),
}

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("configuration error: {0}")]
    Configuration(#[from] CatalogError),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("destination schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("tenant '{0}' is busy with another restore")]
    Busy(String),

    #[error("operation timed out after {seconds}s")]
    TimedOut { seconds: u64, retryable: bool },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store: {0}")]
    Store(#[from] anyhow::Error),
}

impl VaultError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Configuration(_) => 500,
            Self::Validation(_) => 400,
            Self::SchemaMismatch(_) => 422,
            Self::Busy(_) => 409,
            Self::TimedOut { .. } => 504,
            Self::NotFound(_) => 404,
            Self::Store(_) => 500,
        }
    }

    /// Whether the caller may simply try again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Busy(_) => true,
            Self::TimedOut { retryable, .. } => *retryable,
            _ => false,
        }
    }
}
