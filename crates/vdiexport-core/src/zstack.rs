//! HTTP client for a ZStack-style management API.

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::api::{ManagementApi, StopMode, VmQuery, VmRecord};
use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::session::{Credentials, Session};

const LOGIN_PATH: &str = "/zstack/v1/accounts/login";
const VM_INSTANCES_PATH: &str = "/zstack/v1/vm-instances";

#[derive(Debug, Deserialize)]
struct LoginResponse {
    inventory: Option<LoginInventory>,
}

#[derive(Debug, Deserialize)]
struct LoginInventory {
    uuid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InventoryList {
    #[serde(default)]
    inventories: Option<Vec<VmRecord>>,
}

/// Blocking HTTP implementation of [`ManagementApi`].
#[derive(Debug, Clone)]
pub struct ZStackClient {
    base_url: String,
    http: Client,
}

impl ZStackClient {
    /// Build a client for the endpoint in `config`.
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::api(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            base_url: config.host.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn vm_url(&self, vm_id: &str) -> String {
        format!("{}/{}", self.url(VM_INSTANCES_PATH), vm_id)
    }

    fn actions_url(&self, vm_id: &str) -> String {
        format!("{}/actions", self.vm_url(vm_id))
    }

    fn send(&self, request: RequestBuilder, session: &Session, what: &str) -> Result<Response> {
        let response = request
            .header("Authorization", session.authorization())
            .send()
            .map_err(|e| Error::api(format!("{} request failed: {}", what, e)))?;
        check_status(response, what)
    }

    fn vm_action(&self, session: &Session, vm_id: &str, body: Value, what: &str) -> Result<()> {
        debug!(vm = vm_id, action = what, "submitting VM action");
        self.send(self.http.put(self.actions_url(vm_id)).json(&body), session, what)?;
        Ok(())
    }
}

impl ManagementApi for ZStackClient {
    fn login(&self, credentials: &Credentials) -> Result<Session> {
        let response = self
            .http
            .put(self.url(LOGIN_PATH))
            .json(&login_body(credentials))
            .send()
            .map_err(|e| Error::auth(format!("login request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|e| Error::auth(format!("failed to read login response: {}", e)))?;
        if !status.is_success() {
            return Err(Error::auth(format!(
                "login rejected with {}: {}",
                status,
                body.trim()
            )));
        }
        parse_login_response(&body)
    }

    fn list_vms(&self, session: &Session, query: &VmQuery) -> Result<Vec<VmRecord>> {
        let request = self
            .http
            .get(self.url(VM_INSTANCES_PATH))
            .query(&[("q", query.filter())]);
        let body = read_body(self.send(request, session, "list VMs")?, "list VMs")?;
        parse_inventories(&body)
    }

    fn get_vm(&self, session: &Session, vm_id: &str) -> Result<Option<VmRecord>> {
        let response = self
            .http
            .get(self.vm_url(vm_id))
            .header("Authorization", session.authorization())
            .send()
            .map_err(|e| Error::api(format!("get VM request failed: {}", e)))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = read_body(check_status(response, "get VM")?, "get VM")?;
        Ok(parse_inventories(&body)?
            .into_iter()
            .find(|record| record.uuid == vm_id))
    }

    fn start_vm(&self, session: &Session, vm_id: &str) -> Result<()> {
        self.vm_action(session, vm_id, json!({ "startVmInstance": {} }), "start VM")
    }

    fn stop_vm(&self, session: &Session, vm_id: &str, mode: StopMode) -> Result<()> {
        self.vm_action(
            session,
            vm_id,
            json!({ "stopVmInstance": { "type": mode.as_api_str() } }),
            "stop VM",
        )
    }
}

/// Request body for the login endpoint.
fn login_body(credentials: &Credentials) -> Value {
    json!({
        "logInByAccount": {
            "accountName": credentials.account(),
            "password": credentials.password_digest(),
        }
    })
}

fn parse_login_response(body: &str) -> Result<Session> {
    let response: LoginResponse = serde_json::from_str(body)
        .map_err(|e| Error::auth(format!("malformed login response: {}", e)))?;
    let token = response
        .inventory
        .and_then(|inv| inv.uuid)
        .ok_or_else(|| Error::auth("login response has no inventory.uuid"))?;
    Session::new(token)
}

fn parse_inventories(body: &str) -> Result<Vec<VmRecord>> {
    let list: InventoryList = serde_json::from_str(body)
        .map_err(|e| Error::api(format!("malformed inventory response: {}", e)))?;
    Ok(list.inventories.unwrap_or_default())
}

fn check_status(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(Error::auth(format!("session rejected during {} ({})", what, status)));
    }
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(Error::api(format!("{} returned {}: {}", what, status, body.trim())));
    }
    Ok(response)
}

fn read_body(response: Response, what: &str) -> Result<String> {
    response
        .text()
        .map_err(|e| Error::api(format!("failed to read {} response: {}", what, e)))
}
