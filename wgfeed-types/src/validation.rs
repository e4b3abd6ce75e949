//! Structural and semantic validation for wg-feed envelopes and documents.
//!
//! Checks run in order and fail fast with a descriptive reason. A success
//! envelope's embedded document is validated only on the plaintext branch;
//! decrypted documents are validated separately by the caller after
//! decryption.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use url::Url;

use crate::document::{ErrorEnvelope, FeedDocument, SuccessEnvelope};
use crate::error::{ValidationError, ValidationResult};

/// The single supported protocol version string.
pub const PROTOCOL_VERSION: &str = "wg-feed-00";

// Schema: UUID with RFC 4122 variant bits [89ab].
static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        "^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[89abAB][0-9a-fA-F]{3}-[0-9a-fA-F]{12}$",
    )
    .expect("valid uuid pattern")
});

static TUNNEL_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[A-Za-z][A-Za-z0-9-]*$").expect("valid tunnel name pattern"));

// Schema: data: URL with media type image/svg+xml (case-insensitive),
// arbitrary parameters, any payload.
static SVG_DATA_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new("^data:[iI][mM][aA][gG][eE]/[sS][vV][gG]\\+[xX][mM][lL](?:;[^,]*)?,.*$")
        .expect("valid svg data url pattern")
});

fn ensure(cond: bool, reason: impl Into<String>) -> ValidationResult<()> {
    if cond {
        Ok(())
    } else {
        Err(ValidationError::schema(reason))
    }
}

/// Requires `version` to be the supported protocol version.
pub fn require_supported_version(version: &str) -> ValidationResult<()> {
    if version == PROTOCOL_VERSION {
        Ok(())
    } else {
        Err(ValidationError::UnsupportedVersion(version.to_string()))
    }
}

/// Requires an HTTPS URL with a non-empty host.
pub fn require_https_url(url: &str) -> ValidationResult<()> {
    let parsed = Url::parse(url).map_err(|_| ValidationError::schema("Invalid URL"))?;
    ensure(parsed.scheme() == "https", "HTTPS required")?;
    ensure(
        parsed.host_str().is_some_and(|h| !h.is_empty()),
        "Invalid URL host",
    )
}

/// Requires an HTTP or HTTPS URL with a non-empty host.
///
/// The relaxed variant exists for local development endpoints; production
/// sync paths require HTTPS.
pub fn require_http_or_https_url(url: &str) -> ValidationResult<()> {
    let parsed = Url::parse(url).map_err(|_| ValidationError::schema("Invalid URL"))?;
    ensure(
        parsed.scheme() == "https" || parsed.scheme() == "http",
        "HTTP(S) required",
    )?;
    ensure(
        parsed.host_str().is_some_and(|h| !h.is_empty()),
        "Invalid URL host",
    )
}

fn require_no_fragment(url: &str) -> ValidationResult<()> {
    let parsed = Url::parse(url).map_err(|_| ValidationError::schema("Invalid URL"))?;
    ensure(
        parsed.fragment().is_none_or(|f| f.trim().is_empty()),
        "URL must not include a fragment (#...)",
    )
}

fn require_svg_data_url(icon_url: &str) -> ValidationResult<()> {
    ensure(
        SVG_DATA_URL_RE.is_match(icon_url),
        "icon_url must be a data: URL with media type image/svg+xml",
    )
}

/// Validates a success envelope.
///
/// On the plaintext branch the embedded document is validated too; on the
/// encrypted branch only the envelope shape is checked here.
pub fn validate_success_envelope(envelope: &SuccessEnvelope) -> ValidationResult<()> {
    require_supported_version(&envelope.version)?;
    ensure(envelope.success, "Expected success response")?;
    ensure(!envelope.revision.trim().is_empty(), "Missing revision")?;
    ensure(envelope.ttl_seconds >= 0, "ttl_seconds must be >= 0")?;

    if envelope.encrypted {
        ensure(
            envelope
                .encrypted_data
                .as_deref()
                .is_some_and(|d| !d.trim().is_empty()),
            "Missing encrypted_data",
        )?;
        ensure(
            envelope.data.is_none(),
            "encrypted response must not include data",
        )?;
    } else {
        ensure(
            envelope
                .encrypted_data
                .as_deref()
                .is_none_or(|d| d.trim().is_empty()),
            "unencrypted response must not include encrypted_data",
        )?;
        let doc = envelope
            .data
            .as_ref()
            .ok_or_else(|| ValidationError::schema("Missing data"))?;
        validate_document(doc)?;
    }

    Ok(())
}

/// Validates an error envelope.
pub fn validate_error_envelope(envelope: &ErrorEnvelope) -> ValidationResult<()> {
    require_supported_version(&envelope.version)?;
    ensure(!envelope.success, "Expected error response")?;
    ensure(!envelope.message.trim().is_empty(), "Missing message")
}

/// Validates a feed document.
pub fn validate_document(doc: &FeedDocument) -> ValidationResult<()> {
    ensure(UUID_RE.is_match(&doc.id), "Invalid feed id")?;
    ensure(
        !doc.display_info.title.trim().is_empty(),
        "Missing display_info.title",
    )?;
    if let Some(warning) = &doc.warning_message {
        ensure(!warning.trim().is_empty(), "warning_message must be non-empty")?;
    }

    ensure(
        !doc.endpoints.is_empty(),
        "endpoints must contain at least one item",
    )?;
    let mut seen = HashSet::new();
    for endpoint in &doc.endpoints {
        ensure(!endpoint.trim().is_empty(), "endpoint must be non-empty")?;
        require_https_url(endpoint)?;
        require_no_fragment(endpoint)?;
        ensure(
            seen.insert(endpoint.as_str()),
            format!("Duplicate endpoint: {endpoint}"),
        )?;
    }

    if let Some(icon) = &doc.display_info.icon_url {
        require_svg_data_url(icon)?;
    }

    let mut tunnel_ids = HashSet::new();
    for tunnel in &doc.tunnels {
        ensure(!tunnel.id.trim().is_empty(), "Tunnel id is required")?;
        ensure(
            tunnel_ids.insert(tunnel.id.as_str()),
            format!("Duplicate tunnel id: {}", tunnel.id),
        )?;
        ensure(!tunnel.name.trim().is_empty(), "Tunnel name is required")?;
        ensure(
            TUNNEL_NAME_RE.is_match(&tunnel.name),
            format!("Invalid tunnel name: {}", tunnel.name),
        )?;
        ensure(
            !tunnel.display_info.title.trim().is_empty(),
            "Tunnel display_info.title is required",
        )?;
        ensure(
            !tunnel.wg_quick_config.trim().is_empty(),
            "wg_quick_config is required",
        )?;
        if let Some(icon) = &tunnel.display_info.icon_url {
            require_svg_data_url(icon)?;
        }
    }

    Ok(())
}
