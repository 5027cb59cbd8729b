//! Capture and restore of the URL the user originally asked for

use tracing::debug;
use url::Url;

use crate::session::SessionState;

/// Remember `current_url` unless a destination is already captured.
///
/// A flow restarted midway (e.g. a revocation retry) must not replace the
/// user's true original destination.
pub fn capture_if_absent(session: &mut SessionState, current_url: &str) {
    match &session.redirect_after_auth {
        Some(existing) => {
            debug!(captured = %existing, "redirect already captured, keeping it");
        }
        None => {
            debug!(captured = %current_url, "capturing redirect after auth");
            session.redirect_after_auth = Some(current_url.to_owned());
        }
    }
}

/// Take the captured URL, or `default` when nothing (or an empty string)
/// was captured. Always leaves the session without a captured URL.
pub fn consume(session: &mut SessionState, default: &str) -> String {
    match session.redirect_after_auth.take() {
        Some(url) if !url.is_empty() => url,
        _ => default.to_owned(),
    }
}

/// Rebuild the absolute URL of an inbound request.
///
/// `host` is the Host header value (may carry a port). Ports 80 and 443 are
/// dropped whatever the scheme, and `force_https` rewrites the scheme for
/// deployments behind a TLS-terminating proxy. The query string is kept
/// only when non-empty.
pub fn current_url(
    scheme: &str,
    host: &str,
    path_and_query: &str,
    force_https: bool,
) -> Result<String, url::ParseError> {
    let mut origin = Url::parse(&format!("{scheme}://{host}"))?;
    if force_https {
        // http -> https between special schemes cannot fail
        let _ = origin.set_scheme("https");
    }
    if matches!(origin.port(), Some(80) | Some(443)) {
        let _ = origin.set_port(None);
    }

    let path_and_query = match path_and_query {
        "" => "/",
        pq => pq.strip_suffix('?').unwrap_or(pq),
    };

    Ok(format!(
        "{}{}",
        origin.as_str().trim_end_matches('/'),
        path_and_query
    ))
}
