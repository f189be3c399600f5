//! Method discovery over the live connection.

use std::collections::BTreeSet;

use crate::transport::capability::is_public_name;
use crate::transport::LiveConnection;

/// Sorted, de-duplicated public capability names of `live`; empty when absent.
///
/// Both the client type's shared table and the instance's own table are
/// enumerated, so per-instance additions are discoverable too.
pub fn list_methods(live: Option<&LiveConnection>) -> Vec<String> {
    let Some(live) = live else {
        return Vec::new();
    };
    let client = live.client();
    let shared = client.shared_capabilities();
    let instance = client.instance_capabilities();

    let names: BTreeSet<&str> = shared
        .names()
        .chain(instance.names())
        .filter(|name| is_public_name(name))
        .collect();
    names.into_iter().map(str::to_string).collect()
}
