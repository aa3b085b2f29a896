//! Topic names every cluster member must agree on

pub const BROADCAST: &str = "device:msg:broadcast";
pub const REPLY: &str = "device:msg:reply";

const P2P_PREFIX: &str = "device:msg:p2p:";
const CHECKER_PREFIX: &str = "device:state:checker:";
const CHECK_RESULT_PREFIX: &str = "device:state:check:result:";

/// Commands addressed to devices owned by `server_id`
#[must_use]
pub fn p2p(server_id: &str) -> String {
    format!("{P2P_PREFIX}{server_id}")
}

/// State-check requests served by `server_id`
#[must_use]
pub fn checker(server_id: &str) -> String {
    format!("{CHECKER_PREFIX}{server_id}")
}

/// State-check results awaited by `server_id`
#[must_use]
pub fn check_result(server_id: &str) -> String {
    format!("{CHECK_RESULT_PREFIX}{server_id}")
}
