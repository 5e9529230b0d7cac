use provider_registry::WireVariant;

/// Default base URL for the OAuth responses variant.
pub const DEFAULT_OAUTH_BASE_URL: &str = "https://chatgpt.com/backend-api";

/// Normalize a configured endpoint to the request URL for `variant`.
///
/// Endpoints already naming the variant's path are kept; otherwise the path
/// is appended (`/chat/completions`, `/responses`, `/codex/responses`).
pub fn normalize_endpoint(variant: WireVariant, input: &str) -> String {
    match variant {
        WireVariant::ChatCompletions => append_suffix(input.trim(), "/chat/completions"),
        WireVariant::Responses => append_suffix(input.trim(), "/responses"),
        WireVariant::OauthResponses => normalize_oauth_url(input),
    }
}

fn append_suffix(base: &str, suffix: &str) -> String {
    let trimmed = base.trim_end_matches('/');
    if trimmed.ends_with(suffix) {
        trimmed.to_string()
    } else {
        format!("{trimmed}{suffix}")
    }
}

fn normalize_oauth_url(input: &str) -> String {
    let base = if input.trim().is_empty() {
        DEFAULT_OAUTH_BASE_URL
    } else {
        input.trim()
    };

    let trimmed = base.trim_end_matches('/');
    if trimmed.ends_with("/codex/responses") {
        return trimmed.to_string();
    }
    if trimmed.ends_with("/codex") {
        return format!("{trimmed}/responses");
    }
    format!("{trimmed}/codex/responses")
}
