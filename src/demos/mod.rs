//! Demo nodes, wired up through the public Builder API instead of a
//! compile-time module roster.

mod cryo;

use std::sync::Arc;

use secop_core::errors::Error;
use secop_core::node::Node;
use secop_core::registry::Registry;
use serde_json::json;

/// Build every demo node and hand back the ones ready to be served.
pub fn build_nodes() -> Result<Vec<Arc<Node>>, Error> {
    Registry::create_node("cryo", "demo sample-environment node", "0.0.0.0", 10767)?;
    Registry::add_property("equipment_id", json!("demo-cryo-001"))?;
    cryo::install()?;
    Registry::node_complete()?;
    Ok(vec![Registry::node("cryo")?])
}
