pub const PATH_FORM: &str = "/";
pub const PATH_SAVE: &str = "/save";

pub const CONNECTIVITY_CHECK_PATHS: [&str; 6] = [
    "/generate_204",
    "/gen_204",
    "/hotspot-detect.html",
    "/connecttest.txt",
    "/ncsi.txt",
    "/fwlink",
];

pub const PROVISIONING_AP_SSID: &str = "Relay Setup";
pub const PROVISIONING_AP_PASSWORD: &str = "12345678";
pub const PROVISIONING_AP_CHANNEL: u8 = 1;

pub const DEFAULT_API_BASE: &str = "http://10.0.48.186:3000/appliances";
