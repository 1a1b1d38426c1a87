//! Standalone HTTP client for the COSA thermostat cloud API.
//!
//! - Blocking client using `ureq` (no async).
//! - Every endpoint is a JSON `POST`; responses are checked for the `ok: 0` error envelope.
//! - Uses the wire models in `crate::models::cosa`.
//!
//! Authentication
//! - `login` exchanges email/password for a token sent as the `authtoken` header.
//! - When credentials are configured, a rejected token triggers one re-login and a retry.

use http::StatusCode;
use log::{debug, info, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::cell::RefCell;
use std::time::Duration;

use crate::models::cosa::*;

pub const DEFAULT_BASE_URL: &str = "https://kiwi-api.nuvia.com.tr";

const ENDPOINT_LOGIN: &str = "/api/users/login";
const ENDPOINT_GET_ENDPOINTS: &str = "/api/endpoints/getEndpoints";
const ENDPOINT_GET_ENDPOINT: &str = "/api/endpoints/getEndpoint";
const ENDPOINT_SET_MODE: &str = "/api/endpoints/setMode";
const ENDPOINT_SET_TARGET_TEMPERATURES: &str = "/api/endpoints/setTargetTemperatures";
const ENDPOINT_SET_CHILD_LOCK: &str = "/api/endpoints/setChildLock";
const ENDPOINT_SET_OPEN_WINDOW: &str = "/api/endpoints/setOpenWindow";
const ENDPOINT_SET_CALIBRATION: &str = "/api/endpoints/setCalibration";
const ENDPOINT_GET_REPORTS: &str = "/api/endpoints/getReports";
const ENDPOINT_GET_FORECAST: &str = "/api/places/getForecast";

const HEADER_USER_AGENT: &str = "Cosa/1 CFNetwork/3860.200.71 Darwin/25.1.0";
const HEADER_PROVIDER: &str = "cosa";
const REPORTS_RANGE: &str = "24h";
/// API error code for a wrong email/password pair.
const CODE_INVALID_CREDENTIALS: &str = "111";
const TOKEN_KEYS: [&str; 5] = ["authtoken", "authToken", "token", "accessToken", "access_token"];
const BODY_EXCERPT_LEN: usize = 200;

#[derive(Debug)]
pub enum CosaClientError {
    MissingAuth,
    Transport(String),
    Timeout(String),
    Http { status: u16, message: String },
    Json(serde_json::Error),
    Decode(serde_path_to_error::Error<serde_json::Error>),
    Auth(String),
    Api { code: String },
}

impl CosaClientError {
    /// Credentials or token were rejected.
    pub fn is_auth(&self) -> bool {
        matches!(self, CosaClientError::MissingAuth | CosaClientError::Auth(_))
    }

    /// Worth retrying on the next poll without operator intervention.
    pub fn is_transient(&self) -> bool {
        match self {
            CosaClientError::Transport(_) | CosaClientError::Timeout(_) | CosaClientError::Api { .. } => true,
            CosaClientError::Http { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS.as_u16() || *status >= 500
            }
            _ => false,
        }
    }

    /// The server answered, but with a body we could not make sense of.
    pub fn is_malformed(&self) -> bool {
        matches!(self, CosaClientError::Json(_) | CosaClientError::Decode(_))
    }
}

impl core::fmt::Display for CosaClientError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CosaClientError::MissingAuth => write!(f, "no token and no credentials configured"),
            CosaClientError::Transport(s) => write!(f, "transport error: {}", s),
            CosaClientError::Timeout(s) => write!(f, "request timed out: {}", s),
            CosaClientError::Http { status, message } => write!(f, "http {}: {}", status, message),
            CosaClientError::Json(e) => write!(f, "json error: {}", e),
            CosaClientError::Decode(e) => write!(f, "unexpected response structure at {}", e),
            CosaClientError::Auth(e) => write!(f, "auth error: {}", e),
            CosaClientError::Api { code } => write!(f, "api returned ok=0 (code={})", code),
        }
    }
}

impl std::error::Error for CosaClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CosaClientError::Json(e) => Some(e),
            CosaClientError::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CosaClientError {
    fn from(value: serde_json::Error) -> Self {
        CosaClientError::Json(value)
    }
}

impl From<ureq::Error> for CosaClientError {
    fn from(value: ureq::Error) -> Self {
        match value {
            ureq::Error::Timeout(t) => CosaClientError::Timeout(format!("{:?}", t)),
            other => CosaClientError::Transport(other.to_string()),
        }
    }
}

/// Anything that can report device state and accept control commands.
///
/// Implemented by [`RemoteDevice`] for the real cloud API and by the simulator.
pub trait CosaApi {
    fn fetch_state(&self) -> Result<RemoteState, CosaClientError>;
    fn send(&self, command: &Command) -> Result<(), CosaClientError>;
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

#[derive(Debug)]
struct AuthState {
    token: Option<String>,
    credentials: Option<Credentials>,
}

pub struct CosaClient {
    agent: ureq::Agent,
    base_url: String,
    auth: RefCell<AuthState>,
}

fn excerpt(body: &str) -> String {
    body.chars().take(BODY_EXCERPT_LEN).collect()
}

fn api_code(value: &Value) -> String {
    match value.get("code") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => "unknown".to_string(),
    }
}

/// Turn a raw HTTP status and body into the JSON payload, or the matching error.
pub(crate) fn classify_response(status: StatusCode, body: &str) -> Result<Value, CosaClientError> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(CosaClientError::Auth(format!("http {}: {}", status.as_u16(), excerpt(body))));
    }
    if !status.is_success() {
        return Err(CosaClientError::Http {
            status: status.as_u16(),
            message: excerpt(body),
        });
    }
    let value: Value = serde_json::from_str(body)?;
    if value.get("ok").and_then(Value::as_i64) == Some(0) {
        return Err(CosaClientError::Api { code: api_code(&value) });
    }
    Ok(value)
}

/// Locate the token in a login response; it has been seen under several keys, either at the
/// top level or inside a `data` wrapper.
pub(crate) fn extract_token(value: &Value) -> Option<String> {
    let find = |obj: &Value| {
        TOKEN_KEYS
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str).map(str::to_string))
    };
    find(value).or_else(|| value.get("data").filter(|d| d.is_object()).and_then(find))
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, CosaClientError> {
    serde_path_to_error::deserialize(value).map_err(CosaClientError::Decode)
}

/// `getEndpoint` wraps the object in `endpoint`; older responses return it bare.
fn unwrap_key(mut value: Value, key: &str) -> Value {
    if value.get(key).is_some_and(Value::is_object) {
        return value[key].take();
    }
    value
}

impl CosaClient {
    /// Build a client. Logs in immediately when no token is supplied.
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        token: Option<String>,
        credentials: Option<Credentials>,
    ) -> Result<Self, CosaClientError> {
        if token.is_none() && credentials.is_none() {
            return Err(CosaClientError::MissingAuth);
        }
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();
        let client = CosaClient {
            agent: ureq::Agent::new_with_config(config),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth: RefCell::new(AuthState { token, credentials }),
        };
        if client.auth.borrow().token.is_none() {
            client.login()?;
        }
        Ok(client)
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn post_raw<B: Serialize>(&self, path: &str, body: &B, token: Option<&str>) -> Result<Value, CosaClientError> {
        let url = self.url(path);
        let mut req = self
            .agent
            .post(&url)
            .header("User-Agent", HEADER_USER_AGENT)
            .header("provider", HEADER_PROVIDER)
            .header("Accept", "*/*")
            .header("Accept-Language", "tr-TR,tr;q=0.9");
        if let Some(t) = token {
            req = req.header("authtoken", t);
        }
        let mut res = req.send_json(body)?;
        let status = res.status();
        let text = res.body_mut().read_to_string()?;
        debug!("POST {} -> {}", path, status.as_u16());
        classify_response(status, &text)
    }

    /// Exchange the configured credentials for a fresh token.
    pub fn login(&self) -> Result<(), CosaClientError> {
        let credentials = self
            .auth
            .borrow()
            .credentials
            .clone()
            .ok_or(CosaClientError::MissingAuth)?;
        let body = LoginRequest {
            email: &credentials.email,
            password: &credentials.password,
        };
        let value = match self.post_raw(ENDPOINT_LOGIN, &body, None) {
            Ok(v) => v,
            Err(CosaClientError::Api { code }) if code == CODE_INVALID_CREDENTIALS => {
                return Err(CosaClientError::Auth("invalid email or password".into()));
            }
            Err(CosaClientError::Auth(_)) => {
                return Err(CosaClientError::Auth("invalid email or password".into()));
            }
            Err(e) => return Err(e),
        };
        let token = extract_token(&value).ok_or_else(|| CosaClientError::Auth("no token in login response".into()))?;
        self.auth.borrow_mut().token = Some(token);
        info!("Logged in to COSA API as {}", credentials.email);
        Ok(())
    }

    /// Authenticated POST; on a rejected token, re-login once (if possible) and retry.
    fn post_json<B: Serialize>(&self, path: &str, body: &B) -> Result<Value, CosaClientError> {
        let token = self.auth.borrow().token.clone().ok_or(CosaClientError::MissingAuth)?;
        match self.post_raw(path, body, Some(&token)) {
            Err(e) if e.is_auth() && self.auth.borrow().credentials.is_some() => {
                warn!("Token rejected on {}; logging in again", path);
                self.login()?;
                let token = self.auth.borrow().token.clone().ok_or(CosaClientError::MissingAuth)?;
                self.post_raw(path, body, Some(&token))
            }
            other => other,
        }
    }

    pub fn get_endpoints(&self) -> Result<Vec<Endpoint>, CosaClientError> {
        let mut value = self.post_json(ENDPOINT_GET_ENDPOINTS, &serde_json::json!({}))?;
        let endpoints = value.get_mut("endpoints").map(Value::take).unwrap_or(Value::Array(Vec::new()));
        decode(endpoints)
    }

    pub fn get_endpoint(&self, endpoint: &EndpointId) -> Result<Endpoint, CosaClientError> {
        let value = self.post_json(ENDPOINT_GET_ENDPOINT, &EndpointRequest { endpoint: &endpoint.0 })?;
        decode(unwrap_key(value, "endpoint"))
    }

    pub fn get_reports(&self, endpoint: &EndpointId) -> Result<Reports, CosaClientError> {
        let value = self.post_json(
            ENDPOINT_GET_REPORTS,
            &ReportsRequest {
                endpoint: &endpoint.0,
                range: REPORTS_RANGE,
            },
        )?;
        decode(unwrap_key(value, "reports"))
    }

    pub fn get_forecast(&self, place: &PlaceId) -> Result<Forecast, CosaClientError> {
        let value = self.post_json(ENDPOINT_GET_FORECAST, &ForecastRequest { place: &place.0 })?;
        decode(unwrap_key(value, "forecast"))
    }

    pub fn set_mode(&self, endpoint: &EndpointId, mode: Mode, option: Option<ModeOption>) -> Result<(), CosaClientError> {
        self.post_json(
            ENDPOINT_SET_MODE,
            &SetModeRequest {
                endpoint: &endpoint.0,
                mode,
                option,
            },
        )?;
        Ok(())
    }

    pub fn set_target_temperatures(
        &self,
        endpoint: &EndpointId,
        target_temperatures: TargetTemperatures,
    ) -> Result<(), CosaClientError> {
        self.post_json(
            ENDPOINT_SET_TARGET_TEMPERATURES,
            &SetTargetTemperaturesRequest {
                endpoint: &endpoint.0,
                target_temperatures,
            },
        )?;
        Ok(())
    }

    pub fn set_child_lock(&self, endpoint: &EndpointId, child_lock: bool) -> Result<(), CosaClientError> {
        self.post_json(
            ENDPOINT_SET_CHILD_LOCK,
            &SetChildLockRequest {
                endpoint: &endpoint.0,
                child_lock,
            },
        )?;
        Ok(())
    }

    pub fn set_open_window(&self, endpoint: &EndpointId, open_window: bool) -> Result<(), CosaClientError> {
        self.post_json(
            ENDPOINT_SET_OPEN_WINDOW,
            &SetOpenWindowRequest {
                endpoint: &endpoint.0,
                open_window,
            },
        )?;
        Ok(())
    }

    pub fn set_calibration(&self, endpoint: &EndpointId, calibration: f64) -> Result<(), CosaClientError> {
        self.post_json(
            ENDPOINT_SET_CALIBRATION,
            &SetCalibrationRequest {
                endpoint: &endpoint.0,
                calibration,
            },
        )?;
        Ok(())
    }
}

/// A client bound to one thermostat (and optionally the place used for the forecast).
pub struct RemoteDevice {
    pub client: CosaClient,
    pub endpoint: EndpointId,
    pub place: Option<PlaceId>,
    pub reports_enabled: bool,
}

impl CosaApi for RemoteDevice {
    fn fetch_state(&self) -> Result<RemoteState, CosaClientError> {
        let endpoint = self.client.get_endpoint(&self.endpoint)?;

        // Auxiliary data: failures leave the corresponding snapshot fields at their last value.
        let reports = if self.reports_enabled {
            self.client
                .get_reports(&self.endpoint)
                .map_err(|e| warn!("getReports({}) failed: {}", self.endpoint.0, e))
                .ok()
        } else {
            None
        };
        let forecast = self.place.as_ref().and_then(|place| {
            self.client
                .get_forecast(place)
                .map_err(|e| warn!("getForecast({}) failed: {}", place.0, e))
                .ok()
        });

        Ok(RemoteState {
            endpoint,
            reports,
            forecast,
        })
    }

    fn send(&self, command: &Command) -> Result<(), CosaClientError> {
        let ep = &self.endpoint;
        match command {
            Command::SetMode { mode, option } => self.client.set_mode(ep, *mode, *option),
            Command::SetTargetTemperatures(t) => self.client.set_target_temperatures(ep, *t),
            Command::SetChildLock(on) => self.client.set_child_lock(ep, *on),
            Command::SetOpenWindow(on) => self.client.set_open_window(ep, *on),
            Command::SetCalibration(v) => self.client.set_calibration(ep, *v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_statuses() {
        assert!(matches!(
            classify_response(StatusCode::UNAUTHORIZED, "nope"),
            Err(CosaClientError::Auth(_))
        ));
        let err = classify_response(StatusCode::BAD_GATEWAY, "<html>").unwrap_err();
        assert!(err.is_transient());
        let err = classify_response(StatusCode::NOT_FOUND, "").unwrap_err();
        assert!(!err.is_transient());
        assert!(!err.is_auth());
    }

    #[test]
    fn ok_zero_is_an_api_error() {
        let err = classify_response(StatusCode::OK, r#"{"ok": 0, "code": 111}"#).unwrap_err();
        match err {
            CosaClientError::Api { code } => assert_eq!(code, "111"),
            other => panic!("unexpected {other:?}"),
        }
        let err = classify_response(StatusCode::OK, r#"{"ok": 0}"#).unwrap_err();
        assert!(matches!(err, CosaClientError::Api { ref code } if code == "unknown"));
    }

    #[test]
    fn non_json_body_is_malformed() {
        let err = classify_response(StatusCode::OK, "<html>maintenance</html>").unwrap_err();
        assert!(err.is_malformed());
        assert!(!err.is_transient());
    }

    #[test]
    fn extracts_token_from_known_locations() {
        assert_eq!(extract_token(&json!({"authtoken": "a"})).as_deref(), Some("a"));
        assert_eq!(
            extract_token(&json!({"success": true, "data": {"authToken": "SAMPLETOKEN123"}})).as_deref(),
            Some("SAMPLETOKEN123")
        );
        assert_eq!(extract_token(&json!({"access_token": "z", "data": {"token": "y"}})).as_deref(), Some("z"));
        assert_eq!(extract_token(&json!({"token": 12})), None);
        assert_eq!(extract_token(&json!({"data": "token"})), None);
    }

    #[test]
    fn unwraps_endpoint_envelope_or_bare_object() {
        let wrapped = json!({"ok": 1, "endpoint": {"id": "e1"}});
        assert_eq!(unwrap_key(wrapped, "endpoint"), json!({"id": "e1"}));
        let bare = json!({"id": "e1", "endpoint": "not-an-object"});
        assert_eq!(unwrap_key(bare.clone(), "endpoint"), bare);
    }

    #[test]
    fn decodes_endpoint_list_fixture() {
        let json = std::fs::read_to_string("tests/data/endpoints.json").expect("fixture present");
        let mut value: Value = serde_json::from_str(&json).unwrap();
        let endpoints: Vec<Endpoint> = decode(value["endpoints"].take()).unwrap();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[1].endpoint_id(), Some(EndpointId("66e06d3edac55e12009be999".into())));
        assert_eq!(endpoints[1].option, Some(ModeOption::Frozen));
    }

    #[test]
    fn decode_error_names_the_path() {
        let err = decode::<Vec<Endpoint>>(json!([{"id": "a"}, 7])).unwrap_err();
        assert!(err.is_malformed());
        assert!(err.to_string().contains("[1]"), "{}", err);
    }

    #[test]
    fn client_without_any_auth_is_rejected() {
        let res = CosaClient::new(DEFAULT_BASE_URL, Duration::from_secs(1), None, None);
        assert!(matches!(res, Err(CosaClientError::MissingAuth)));
    }
}
