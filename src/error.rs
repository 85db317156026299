//! Error taxonomy: categories, severities, and structured reports.
//!
//! Policy code (retry, circuit breaker) makes decisions by matching on the
//! closed [`ErrorCategory`] enum instead of downcasting concrete error
//! types. Every error constructed here maps to exactly one category.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Result type for operations that surface taxonomy errors.
pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// Severity and Category
// ============================================================================

/// Error severity levels for prioritization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// System failure, immediate attention needed.
    Critical,
    /// Major functionality impaired.
    High,
    /// Some functionality affected.
    Medium,
    /// Minor issue, workaround available.
    Low,
    /// Informational, no action required.
    Info,
}

impl std::fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// Error categories for classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Database connection/query errors.
    Database,
    /// External API errors.
    Api,
    /// Input validation errors.
    Validation,
    /// Configuration errors.
    Configuration,
    /// Security-related errors.
    Security,
    /// Network connectivity errors.
    Network,
    /// File system errors.
    Filesystem,
    /// Data parsing errors.
    Parsing,
    /// Data processing errors.
    Processing,
    /// Uncategorized errors.
    Unknown,
}

impl ErrorCategory {
    /// Default severity assigned to errors of this category.
    pub fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Security => ErrorSeverity::Critical,
            Self::Database | Self::Configuration => ErrorSeverity::High,
            Self::Validation => ErrorSeverity::Low,
            _ => ErrorSeverity::Medium,
        }
    }

    /// Canonical error type name for this category, used in reports.
    pub fn type_name(self) -> &'static str {
        match self {
            Self::Database => "DatabaseError",
            Self::Api => "ApiError",
            Self::Validation => "ValidationError",
            Self::Configuration => "ConfigurationError",
            Self::Security => "SecurityError",
            Self::Network => "NetworkError",
            Self::Filesystem => "FilesystemError",
            Self::Parsing => "ParsingError",
            Self::Processing => "ProcessingError",
            Self::Unknown => "UnknownError",
        }
    }

    fn default_suggestions(self) -> Vec<String> {
        let suggestions: &[&str] = match self {
            Self::Database => &[
                "Check database connection settings",
                "Verify database server is running",
                "Check network connectivity to database",
            ],
            Self::Api => &[
                "Check API status",
                "Verify API credentials",
                "Check rate limits",
                "Retry with exponential backoff",
            ],
            Self::Validation => &[
                "Check input format",
                "Verify required fields are provided",
            ],
            Self::Configuration => &[
                "Check configuration file",
                "Verify environment variables",
                "Ensure all required settings are configured",
            ],
            Self::Security => &[
                "Review security configuration",
                "Check authentication credentials",
                "Verify authorization settings",
            ],
            Self::Network => &[
                "Check network connectivity",
                "Verify firewall settings",
                "Retry after network recovery",
            ],
            Self::Filesystem => &[
                "Check file and directory permissions",
                "Verify path exists",
                "Ensure sufficient disk space",
            ],
            Self::Parsing => &[
                "Verify data format",
                "Check for encoding issues",
            ],
            Self::Processing => &[
                "Check input data quality",
                "Review processing logs",
            ],
            Self::Unknown => &[],
        };
        suggestions.iter().map(|s| (*s).to_string()).collect()
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Database => "database",
            Self::Api => "api",
            Self::Validation => "validation",
            Self::Configuration => "configuration",
            Self::Security => "security",
            Self::Network => "network",
            Self::Filesystem => "filesystem",
            Self::Parsing => "parsing",
            Self::Processing => "processing",
            Self::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

// ============================================================================
// Error Context
// ============================================================================

/// Context captured alongside an error for tracking and correlation.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorContext {
    /// Wall-clock time the context was captured.
    pub timestamp: DateTime<Utc>,
    /// Originating module, if known.
    pub module: Option<String>,
    /// Originating function, if known.
    pub function: Option<String>,
    /// User identifier, if any.
    pub user_id: Option<String>,
    /// Session identifier, if any.
    pub session_id: Option<String>,
    /// Request identifier, if any.
    pub request_id: Option<String>,
    /// Free-form additional data.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ErrorContext {
    /// Create an empty context stamped with the current time.
    pub fn new() -> Self {
        Self {
            timestamp: Utc::now(),
            module: None,
            function: None,
            user_id: None,
            session_id: None,
            request_id: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Set the originating module.
    pub fn module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    /// Set the originating function.
    pub fn function(mut self, function: impl Into<String>) -> Self {
        self.function = Some(function.into());
        self
    }

    /// Set the user identifier.
    pub fn user_id(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    /// Set the session identifier.
    pub fn session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    /// Set the request identifier.
    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Attach a free-form key/value pair.
    pub fn extra(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Base Error
// ============================================================================

/// Base error carrying structured classification data and recovery hints.
///
/// Constructed through per-category constructors; policy code matches on
/// [`category`](Error::category) rather than concrete types.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct Error {
    message: String,
    category: ErrorCategory,
    severity: ErrorSeverity,
    status: Option<u16>,
    context: ErrorContext,
    recovery_suggestions: Vec<String>,
    error_id: String,
    #[source]
    source: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    /// Create an error in the given category with that category's default
    /// severity and recovery suggestions.
    pub fn new(message: impl Into<String>, category: ErrorCategory) -> Self {
        Self {
            message: message.into(),
            category,
            severity: category.default_severity(),
            status: None,
            context: ErrorContext::new(),
            recovery_suggestions: category.default_suggestions(),
            error_id: generate_error_id(),
            source: None,
        }
    }

    /// Database connection/query error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::new(message, ErrorCategory::Database)
    }

    /// External API error.
    pub fn api(message: impl Into<String>) -> Self {
        Self::new(message, ErrorCategory::Api)
    }

    /// Input validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(message, ErrorCategory::Validation)
    }

    /// Configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(message, ErrorCategory::Configuration)
    }

    /// Security-related error.
    pub fn security(message: impl Into<String>) -> Self {
        Self::new(message, ErrorCategory::Security)
    }

    /// Network connectivity error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(message, ErrorCategory::Network)
    }

    /// File system error.
    pub fn filesystem(message: impl Into<String>) -> Self {
        Self::new(message, ErrorCategory::Filesystem)
    }

    /// Data parsing error.
    pub fn parsing(message: impl Into<String>) -> Self {
        Self::new(message, ErrorCategory::Parsing)
    }

    /// Data processing error.
    pub fn processing(message: impl Into<String>) -> Self {
        Self::new(message, ErrorCategory::Processing)
    }

    /// Uncategorized error.
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(message, ErrorCategory::Unknown)
    }

    /// Override the severity.
    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// Attach an HTTP-style status code (API errors).
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Replace the captured context.
    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = context;
        self
    }

    /// Append a recovery suggestion.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.recovery_suggestions.push(suggestion.into());
        self
    }

    /// Attach a free-form key/value pair to the context.
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.extra.insert(key.into(), value.into());
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The error category.
    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    /// The error severity.
    pub fn severity(&self) -> ErrorSeverity {
        self.severity
    }

    /// The HTTP-style status code, if any.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// The captured context.
    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    /// Recovery suggestions for operators.
    pub fn recovery_suggestions(&self) -> &[String] {
        &self.recovery_suggestions
    }

    /// Unique identifier of this error instance.
    pub fn error_id(&self) -> &str {
        &self.error_id
    }
}

fn generate_error_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("ERR-{}-{}", Utc::now().format("%Y%m%d"), &uuid[..8])
}

// ============================================================================
// Error Report
// ============================================================================

/// The loggable/auditable unit built from an [`Error`].
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    /// Unique identifier of the originating error.
    pub error_id: String,
    /// Severity of the error.
    pub severity: ErrorSeverity,
    /// Category of the error.
    pub category: ErrorCategory,
    /// The error message.
    pub message: String,
    /// Canonical type name of the originating error.
    pub error_type: String,
    /// Messages of the underlying cause chain, outermost first.
    pub trace: Vec<String>,
    /// Context captured with the error.
    pub context: ErrorContext,
    /// Recovery suggestions for operators.
    pub recovery_suggestions: Vec<String>,
    /// Identifiers of related errors.
    pub related_errors: Vec<String>,
}

impl ErrorReport {
    /// Build a report from an error, capturing its cause chain.
    pub fn from_error(error: &Error) -> Self {
        let mut trace = Vec::new();
        let mut source: Option<&(dyn std::error::Error + 'static)> =
            std::error::Error::source(error);
        while let Some(cause) = source {
            trace.push(cause.to_string());
            source = cause.source();
        }

        Self {
            error_id: error.error_id.clone(),
            severity: error.severity,
            category: error.category,
            message: error.message.clone(),
            error_type: error.category.type_name().to_string(),
            trace,
            context: error.context.clone(),
            recovery_suggestions: error.recovery_suggestions.clone(),
            related_errors: Vec::new(),
        }
    }

    /// Link another error id as related.
    pub fn with_related(mut self, error_id: impl Into<String>) -> Self {
        self.related_errors.push(error_id.into());
        self
    }
}

// ============================================================================
// Error Log
// ============================================================================

/// Bounded in-memory history of error reports with aggregate counters.
pub struct ErrorLog {
    max_history: usize,
    inner: Mutex<ErrorLogInner>,
}

struct ErrorLogInner {
    history: VecDeque<ErrorReport>,
    total_errors: u64,
    by_severity: HashMap<ErrorSeverity, u64>,
    by_category: HashMap<ErrorCategory, u64>,
}

/// Aggregate counters over everything recorded in an [`ErrorLog`].
#[derive(Debug, Clone, Serialize)]
pub struct ErrorLogSummary {
    /// Total errors recorded.
    pub total_errors: u64,
    /// Errors recorded at critical severity.
    pub critical_errors: u64,
    /// Per-severity counts.
    pub by_severity: HashMap<String, u64>,
    /// Per-category counts.
    pub by_category: HashMap<String, u64>,
    /// Reports currently retained.
    pub history_len: usize,
}

impl ErrorLog {
    /// Create a log retaining at most `max_history` reports.
    pub fn new(max_history: usize) -> Self {
        Self {
            max_history,
            inner: Mutex::new(ErrorLogInner {
                history: VecDeque::new(),
                total_errors: 0,
                by_severity: HashMap::new(),
                by_category: HashMap::new(),
            }),
        }
    }

    /// Record an error: log it at a level matching its severity, retain the
    /// report, and bump counters. Returns the report.
    pub fn record(&self, err: &Error) -> ErrorReport {
        let report = ErrorReport::from_error(err);

        match err.severity() {
            ErrorSeverity::Critical | ErrorSeverity::High => error!(
                error_id = %report.error_id,
                category = %report.category,
                severity = %report.severity,
                "{}",
                report.message
            ),
            ErrorSeverity::Medium | ErrorSeverity::Low => warn!(
                error_id = %report.error_id,
                category = %report.category,
                "{}",
                report.message
            ),
            ErrorSeverity::Info => info!(error_id = %report.error_id, "{}", report.message),
        }

        let mut inner = self.inner.lock();
        inner.total_errors += 1;
        *inner.by_severity.entry(err.severity()).or_insert(0) += 1;
        *inner.by_category.entry(err.category()).or_insert(0) += 1;
        inner.history.push_back(report.clone());
        while inner.history.len() > self.max_history {
            inner.history.pop_front();
        }

        report
    }

    /// The most recent `n` reports, newest last.
    pub fn recent(&self, n: usize) -> Vec<ErrorReport> {
        let inner = self.inner.lock();
        inner
            .history
            .iter()
            .rev()
            .take(n)
            .rev()
            .cloned()
            .collect()
    }

    /// Aggregate counters.
    pub fn summary(&self) -> ErrorLogSummary {
        let inner = self.inner.lock();
        ErrorLogSummary {
            total_errors: inner.total_errors,
            critical_errors: inner
                .by_severity
                .get(&ErrorSeverity::Critical)
                .copied()
                .unwrap_or(0),
            by_severity: inner
                .by_severity
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            by_category: inner
                .by_category
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            history_len: inner.history.len(),
        }
    }

    /// Clear history and counters.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.history.clear();
        inner.total_errors = 0;
        inner.by_severity.clear();
        inner.by_category.clear();
    }
}

impl Default for ErrorLog {
    fn default() -> Self {
        Self::new(1000)
    }
}
