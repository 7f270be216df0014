//! HTTP/HTTPS endpoint probe

use tracing::error;

use crate::actors::messages::CheckStatus;
use crate::config::HttpMethod;

/// Probe an HTTP endpoint and evaluate the response.
///
/// Status codes outside the expected set (any 2xx by default) and body
/// pattern mismatches are failures; transport-level errors are reported with
/// their reason.
pub(super) async fn probe(
    client: &reqwest::Client,
    url: &str,
    method: HttpMethod,
    expected_status: Option<&[u16]>,
    body_pattern: Option<&str>,
) -> (CheckStatus, Option<String>) {
    let method = match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Head => reqwest::Method::HEAD,
    };
    let is_head = method == reqwest::Method::HEAD;

    let response = match client.request(method, url).send().await {
        Ok(response) => response,
        Err(e) => return (CheckStatus::Failure(e.to_string()), None),
    };

    let status_code = response.status().as_u16();

    let status_ok = match expected_status {
        Some(expected) => expected.contains(&status_code),
        // Default: any 2xx status is success
        None => (200..300).contains(&status_code),
    };

    if !status_ok {
        return (
            CheckStatus::Failure(format!("unexpected status code: {status_code}")),
            None,
        );
    }

    if let Some(pattern) = body_pattern
        && !is_head
    {
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return (
                    CheckStatus::Failure(format!("failed to read response body: {e}")),
                    None,
                );
            }
        };

        match regex::Regex::new(pattern) {
            Ok(re) => {
                if !re.is_match(&body) {
                    return (
                        CheckStatus::Failure(format!("body did not match pattern '{pattern}'")),
                        None,
                    );
                }
            }
            Err(e) => {
                // validation rejects these up front; reaching here is a bug
                error!("invalid body pattern '{pattern}': {e}");
                return (CheckStatus::Failure(format!("invalid body pattern: {e}")), None);
            }
        }
    }

    (CheckStatus::Success, Some(format!("http status {status_code}")))
}
