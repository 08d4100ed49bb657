//! Server Discovery and Monitoring (§4.C, §4.D, §4.F): topology/server descriptions, the Monitor
//! and Push Monitor tasks that keep them current, and the Topology actor that applies their
//! results and answers server selection requests.

pub(crate) mod description;
mod message_manager;
pub(crate) mod monitor;
pub(crate) mod topology;

pub(crate) use description::{
    server::{ServerDescription, ServerType},
    topology::{TopologyDescription, TopologyType},
};
pub(crate) use topology::{SelectedServer, Topology, TopologyUpdater};
