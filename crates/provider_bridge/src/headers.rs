use std::collections::BTreeMap;

use provider_registry::{Credential, ProviderConfig, WireVariant};

use crate::error::BridgeError;

pub const HEADER_ACCEPT: &str = "accept";
pub const HEADER_CONTENT_TYPE: &str = "content-type";
pub const HEADER_AUTHORIZATION: &str = "authorization";
pub const HEADER_ACCOUNT_ID: &str = "chatgpt-account-id";
pub const HEADER_OPENAI_BETA: &str = "openai-beta";
pub const HEADER_ORIGINATOR: &str = "originator";
pub const HEADER_USER_AGENT: &str = "user-agent";
pub const HEADER_REFERER: &str = "http-referer";
pub const HEADER_TITLE: &str = "x-title";

pub const ORIGINATOR: &str = "zagent";

/// Build a deterministic header map for one provider request.
pub fn build_headers(
    provider: &ProviderConfig,
    credential: &Credential,
) -> Result<BTreeMap<String, String>, BridgeError> {
    let mut headers = BTreeMap::new();

    headers.insert(
        HEADER_CONTENT_TYPE.to_owned(),
        "application/json".to_owned(),
    );
    let accept = if provider.wire.is_streaming() {
        "text/event-stream"
    } else {
        "application/json"
    };
    headers.insert(HEADER_ACCEPT.to_owned(), accept.to_owned());

    let token = credential.token.trim();
    if !token.is_empty() {
        headers.insert(HEADER_AUTHORIZATION.to_owned(), format!("Bearer {token}"));
    }

    if provider.wire == WireVariant::OauthResponses {
        let account_id = credential
            .account_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or(BridgeError::MissingAccountId)?;
        headers.insert(HEADER_ACCOUNT_ID.to_owned(), account_id.to_owned());
        headers.insert(
            HEADER_OPENAI_BETA.to_owned(),
            "responses=experimental".to_owned(),
        );
        headers.insert(HEADER_ORIGINATOR.to_owned(), ORIGINATOR.to_owned());
    }

    if let Some(referer) = non_empty(provider.referer.as_deref()) {
        headers.insert(HEADER_REFERER.to_owned(), referer.to_owned());
    }
    if let Some(title) = non_empty(provider.title.as_deref()) {
        headers.insert(HEADER_TITLE.to_owned(), title.to_owned());
    }

    let user_agent = non_empty(provider.user_agent.as_deref())
        .map(ToOwned::to_owned)
        .unwrap_or_else(default_user_agent);
    headers.insert(HEADER_USER_AGENT.to_owned(), user_agent);

    Ok(headers)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// `zagent/<version> (<os> <release>; <arch>)`.
pub fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match runtime_os_triplet() {
        Some((platform, release, arch)) => {
            format!("{ORIGINATOR}/{version} ({platform} {release}; {arch})")
        }
        None => format!("{ORIGINATOR}/{version}"),
    }
}

fn normalize_arch(arch: &str) -> String {
    match arch.to_ascii_lowercase().as_str() {
        "x86_64" | "amd64" => "x64".to_owned(),
        "x86" | "i386" | "i686" => "ia32".to_owned(),
        "aarch64" => "arm64".to_owned(),
        normalized => normalized.to_owned(),
    }
}

#[cfg(unix)]
fn runtime_os_triplet() -> Option<(String, String, String)> {
    use std::ffi::CStr;
    use std::mem::MaybeUninit;

    let mut raw = MaybeUninit::<libc::utsname>::uninit();
    // SAFETY: `uname` initializes the provided `utsname` struct on success.
    let rc = unsafe { libc::uname(raw.as_mut_ptr()) };
    if rc != 0 {
        return None;
    }

    // SAFETY: `uname` returned success, so `raw` is initialized.
    let raw = unsafe { raw.assume_init() };
    // SAFETY: `uname` fills NUL-terminated fixed-size C strings.
    let (platform, release, arch) = unsafe {
        (
            CStr::from_ptr(raw.sysname.as_ptr()).to_string_lossy().to_lowercase(),
            CStr::from_ptr(raw.release.as_ptr()).to_string_lossy().into_owned(),
            normalize_arch(&CStr::from_ptr(raw.machine.as_ptr()).to_string_lossy()),
        )
    };

    if platform.is_empty() || release.is_empty() || arch.is_empty() {
        None
    } else {
        Some((platform, release, arch))
    }
}

#[cfg(not(unix))]
fn runtime_os_triplet() -> Option<(String, String, String)> {
    None
}
