use log::{info, warn};
use serde::Deserialize;

use crate::{
    config::{ControlTiming, DeviceConfig},
    store::{ConfigStore, WriteError},
    types::{Restart, RestartReason},
};

pub const MAX_FORM_BODY_BYTES: usize = 1024;
const MAX_SSID_BYTES: usize = 32;
const MAX_PASS_BYTES: usize = 64;
const MAX_APPLIANCE_ID_BYTES: usize = 64;

const FORM_HEAD: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Relay Setup</title>
  <style>
    body{font-family:Arial,sans-serif;background:#121212;color:#e0e0e0;display:flex;justify-content:center;margin:0;padding:2rem 1rem}
    .card{background:#1e1e1e;border-radius:12px;padding:1.5rem;max-width:400px;width:100%;box-sizing:border-box}
    h1{color:#3b8bff;font-size:1.5rem;margin:0 0 1rem}
    label{display:block;font-weight:bold;font-size:.9rem;margin:.6rem 0 .2rem}
    input[type=text],input[type=password]{width:100%;padding:.7rem;box-sizing:border-box;background:#2b2b2b;color:#e0e0e0;border:1px solid #333;border-radius:6px}
    input[type=submit]{width:100%;margin-top:1.2rem;padding:.8rem;background:#3b8bff;color:#fff;border:0;border-radius:6px;font-weight:bold}
    .err{color:#ff6b6b}
  </style>
</head>
<body>
  <div class="card">
    <h1>Relay Device Setup</h1>
"#;

const FORM_BODY: &str = r#"    <form action="/save" method="post">
      <label for="ssid">WiFi Network (SSID)</label>
      <input type="text" id="ssid" name="ssid" placeholder="Enter WiFi name" required>
      <label for="pass">WiFi Password</label>
      <input type="password" id="pass" name="pass" placeholder="Leave blank for open networks">
      <label for="appid">Appliance ID</label>
      <input type="text" id="appid" name="appid" placeholder="Enter appliance ID" required>
      <input type="submit" value="Save &amp; Reboot">
    </form>
  </div>
</body>
</html>
"#;

pub const SAVED_HTML: &str = "<!doctype html><html><body><h2>Saved!</h2><p>Device is rebooting...</p></body></html>";
pub const SAVE_FAILED_HTML: &str = "<!doctype html><html><body><h2>Save failed</h2><p>Settings could not be stored. Device is rebooting into setup mode...</p></body></html>";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProvisioningForm {
    #[serde(default)]
    pub ssid: String,
    #[serde(default)]
    pub pass: String,
    #[serde(default)]
    pub appid: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Saved { restart: Restart },
    SaveFailed { error: WriteError, restart: Restart },
    Rejected { message: &'static str },
}

impl SubmitOutcome {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Saved { .. } => 200,
            Self::SaveFailed { .. } => 500,
            Self::Rejected { .. } => 400,
        }
    }

    pub fn page(&self) -> String {
        match self {
            Self::Saved { .. } => SAVED_HTML.to_string(),
            Self::SaveFailed { .. } => SAVE_FAILED_HTML.to_string(),
            Self::Rejected { message } => render_form_with_error(message),
        }
    }

    pub fn restart(&self) -> Option<Restart> {
        match self {
            Self::Saved { restart } | Self::SaveFailed { restart, .. } => Some(*restart),
            Self::Rejected { .. } => None,
        }
    }
}

pub fn render_form() -> String {
    format!("{FORM_HEAD}{FORM_BODY}")
}

pub fn render_form_with_error(message: &str) -> String {
    format!(
        "{FORM_HEAD}    <p class=\"err\">{}</p>\n{FORM_BODY}",
        escape_html(message)
    )
}

impl ProvisioningForm {
    pub fn from_urlencoded(body: &[u8]) -> Result<Self, serde_urlencoded::de::Error> {
        serde_urlencoded::from_bytes(body)
    }

    pub fn validate(&self) -> Result<DeviceConfig, &'static str> {
        let appliance_id = self.appid.trim();

        // The ssid is kept verbatim; only blankness is judged trimmed.
        if self.ssid.trim().is_empty() {
            return Err("WiFi network name is required");
        }
        if self.ssid.len() > MAX_SSID_BYTES {
            return Err("WiFi network name must be at most 32 bytes");
        }
        if self.pass.len() > MAX_PASS_BYTES {
            return Err("WiFi password must be at most 64 bytes");
        }
        if appliance_id.is_empty() {
            return Err("Appliance ID is required");
        }
        if appliance_id.len() > MAX_APPLIANCE_ID_BYTES {
            return Err("Appliance ID must be at most 64 bytes");
        }
        if appliance_id
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '/' | '?' | '#' | '%'))
        {
            return Err("Appliance ID must not contain spaces or / ? # %");
        }

        Ok(DeviceConfig::new(self.ssid.clone(), self.pass.clone(), appliance_id))
    }
}

pub fn handle_submit<S>(
    store: &mut S,
    form: &ProvisioningForm,
    timing: &ControlTiming,
) -> SubmitOutcome
where
    S: ConfigStore + ?Sized,
{
    let config = match form.validate() {
        Ok(config) => config,
        Err(message) => {
            warn!("provisioning submission rejected: {message}");
            return SubmitOutcome::Rejected { message };
        }
    };

    let restart = Restart::new(RestartReason::Provisioned, timing.save_restart_delay_ms);
    match store.save(&config) {
        Ok(()) => {
            info!(
                "provisioning saved: ssid=`{}`, appliance=`{}`",
                config.ssid, config.appliance_id
            );
            SubmitOutcome::Saved { restart }
        }
        Err(error) => {
            warn!("provisioning save failed: {error}");
            SubmitOutcome::SaveFailed { error, restart }
        }
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
