//! Declarative per-endpoint audit metadata.
//!
//! Each audited route is registered once with an [`AuditMetadata`] value
//! describing its operation id, domain tag, routing category and the
//! parameters and headers that contribute correlation identifiers. The
//! metadata is validated at registration time so that a missing domain tag
//! fails at startup instead of on the first request.

use crate::event::{EventLogLevel, EventType};
use thiserror::Error;

/// Registration-time metadata errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    /// The required domain tag was blank.
    #[error("Audit metadata for operation '{operation}' has no domains")]
    MissingDomains {
        /// Operation the metadata was declared for.
        operation: String,
    },

    /// An auditable parameter has no usable key.
    #[error("Audit parameter at position {position} has no name")]
    UnnamedParam {
        /// Zero-based position in the declared parameter list.
        position: usize,
    },
}

/// One auditable handler parameter.
///
/// The parameter's audit key is the first non-blank of alias, path variable,
/// query parameter, header and raw parameter name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditParam {
    /// Raw parameter name.
    pub name: String,
    /// Explicit audit name.
    pub alias: Option<String>,
    /// Path variable the parameter is bound to.
    pub path_variable: Option<String>,
    /// Query parameter the parameter is bound to.
    pub query_param: Option<String>,
    /// Header the parameter is bound to.
    pub header: Option<String>,
    /// Also write the value into the diagnostic context.
    pub add_to_diagnostic: bool,
}

impl AuditParam {
    /// Parameter identified by its raw name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the explicit audit name.
    #[must_use]
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Bind to a path variable.
    #[must_use]
    pub fn path_variable(mut self, name: impl Into<String>) -> Self {
        self.path_variable = Some(name.into());
        self
    }

    /// Bind to a query parameter.
    #[must_use]
    pub fn query_param(mut self, name: impl Into<String>) -> Self {
        self.query_param = Some(name.into());
        self
    }

    /// Bind to a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>) -> Self {
        self.header = Some(name.into());
        self
    }

    /// Also store the value in the diagnostic context.
    #[must_use]
    pub const fn add_to_diagnostic(mut self) -> Self {
        self.add_to_diagnostic = true;
        self
    }

    /// Key under which the parameter's value is recorded.
    #[must_use]
    pub fn audit_key(&self) -> &str {
        [
            self.alias.as_deref(),
            self.path_variable.as_deref(),
            self.query_param.as_deref(),
            self.header.as_deref(),
        ]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|candidate| !candidate.is_empty())
        .unwrap_or_else(|| self.name.trim())
    }
}

/// Audit metadata declared for one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditMetadata {
    operation_id: Option<String>,
    doc_operation_id: Option<String>,
    domains: String,
    source_module: Option<String>,
    event_type: EventType,
    event_log_level: EventLogLevel,
    header_names: Vec<String>,
    payload_type: Option<String>,
    params: Vec<AuditParam>,
}

impl AuditMetadata {
    /// Start declaring metadata for an endpoint in the given domain(s).
    #[must_use]
    pub fn builder(domains: impl Into<String>) -> AuditMetadataBuilder {
        AuditMetadataBuilder {
            inner: Self {
                operation_id: None,
                doc_operation_id: None,
                domains: domains.into(),
                source_module: None,
                event_type: EventType::Audit,
                event_log_level: EventLogLevel::Info,
                header_names: Vec::new(),
                payload_type: None,
                params: Vec::new(),
            },
        }
    }

    /// Explicitly declared operation id.
    #[must_use]
    pub fn operation_id(&self) -> Option<&str> {
        self.operation_id.as_deref()
    }

    /// API-documentation operation id.
    #[must_use]
    pub fn doc_operation_id(&self) -> Option<&str> {
        self.doc_operation_id.as_deref()
    }

    /// Domain tag(s).
    #[must_use]
    pub fn domains(&self) -> &str {
        &self.domains
    }

    /// Source module override.
    #[must_use]
    pub fn source_module(&self) -> Option<&str> {
        self.source_module.as_deref()
    }

    /// Routing category.
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Severity.
    #[must_use]
    pub const fn event_log_level(&self) -> EventLogLevel {
        self.event_log_level
    }

    /// Request headers captured into the correlation ids.
    #[must_use]
    pub fn header_names(&self) -> &[String] {
        &self.header_names
    }

    /// Declared payload type.
    #[must_use]
    pub fn payload_type(&self) -> Option<&str> {
        self.payload_type.as_deref()
    }

    /// Auditable parameters, in handler argument order.
    #[must_use]
    pub fn params(&self) -> &[AuditParam] {
        &self.params
    }
}

/// Builder for [`AuditMetadata`]; validation happens in [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct AuditMetadataBuilder {
    inner: AuditMetadata,
}

impl AuditMetadataBuilder {
    /// Declared operation id.
    #[must_use]
    pub fn operation_id(mut self, id: impl Into<String>) -> Self {
        self.inner.operation_id = Some(id.into());
        self
    }

    /// Operation id from API documentation, used when none is declared.
    #[must_use]
    pub fn doc_operation_id(mut self, id: impl Into<String>) -> Self {
        self.inner.doc_operation_id = Some(id.into());
        self
    }

    /// Override the configured source module.
    #[must_use]
    pub fn source_module(mut self, module: impl Into<String>) -> Self {
        self.inner.source_module = Some(module.into());
        self
    }

    /// Routing category.
    #[must_use]
    pub const fn event_type(mut self, event_type: EventType) -> Self {
        self.inner.event_type = event_type;
        self
    }

    /// Severity.
    #[must_use]
    pub const fn event_log_level(mut self, level: EventLogLevel) -> Self {
        self.inner.event_log_level = level;
        self
    }

    /// Capture a request header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>) -> Self {
        self.inner.header_names.push(name.into());
        self
    }

    /// Declared payload type.
    #[must_use]
    pub fn payload_type(mut self, payload_type: impl Into<String>) -> Self {
        self.inner.payload_type = Some(payload_type.into());
        self
    }

    /// Add an auditable parameter. Order must match the handler arguments.
    #[must_use]
    pub fn param(mut self, param: AuditParam) -> Self {
        self.inner.params.push(param);
        self
    }

    /// Validate and finish.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError::MissingDomains`] when the domain tag is blank and
    /// [`MetadataError::UnnamedParam`] when a parameter has no usable key.
    pub fn build(self) -> Result<AuditMetadata, MetadataError> {
        let metadata = self.inner;
        if metadata.domains.trim().is_empty() {
            return Err(MetadataError::MissingDomains {
                operation: metadata
                    .operation_id
                    .clone()
                    .or_else(|| metadata.doc_operation_id.clone())
                    .unwrap_or_else(|| "unknown".to_string()),
            });
        }
        if let Some(position) = metadata
            .params
            .iter()
            .position(|param| param.audit_key().is_empty())
        {
            return Err(MetadataError::UnnamedParam { position });
        }
        Ok(metadata)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn audit_key_prefers_alias_then_bindings_then_name() {
        let param = AuditParam::named("userId")
            .path_variable("id")
            .alias("  ");
        assert_eq!(param.audit_key(), "id");

        let param = AuditParam::named("userId").header("X-User").query_param("user");
        assert_eq!(param.audit_key(), "user");

        let param = AuditParam::named("userId").alias("corrId").header("X-User");
        assert_eq!(param.audit_key(), "corrId");

        assert_eq!(AuditParam::named("userId").audit_key(), "userId");
    }

    #[test]
    fn blank_domains_fail_at_registration() {
        let err = AuditMetadata::builder(" ")
            .operation_id("createUser")
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            MetadataError::MissingDomains {
                operation: "createUser".to_string()
            }
        );
    }

    #[test]
    fn unnamed_param_is_rejected() {
        let err = AuditMetadata::builder("users")
            .param(AuditParam::named("ok"))
            .param(AuditParam::default())
            .build()
            .unwrap_err();
        assert_eq!(err, MetadataError::UnnamedParam { position: 1 });
    }

    #[test]
    fn defaults() {
        let metadata = AuditMetadata::builder("users").build().unwrap();
        assert_eq!(metadata.event_type(), EventType::Audit);
        assert_eq!(metadata.event_log_level(), EventLogLevel::Info);
        assert!(metadata.operation_id().is_none());
        assert!(metadata.params().is_empty());
    }
}
