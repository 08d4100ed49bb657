//! The `TopologyDescription` state machine, as described by the Server Discovery and Monitoring
//! spec, plus the server selection algorithm that operates over it.

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use bson::oid::ObjectId;
use rand::seq::IteratorRandom;
use serde::Deserialize;

use crate::{
    cmap::Command,
    error::{Error, ErrorKind, Result},
    options::{ClientOptions, ServerAddress},
    selection_criteria::{ReadPreference, SelectionCriteria, TagSet},
    sdam::description::server::{ServerDescription, ServerType},
};

const MIN_MAX_STALENESS: Duration = Duration::from_secs(90);

/// The type of a topology, as described by the SDAM spec.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Deserialize)]
pub(crate) enum TopologyType {
    Single,
    ReplicaSetNoPrimary,
    ReplicaSetWithPrimary,
    Sharded,
    Unknown,
}

impl Default for TopologyType {
    fn default() -> Self {
        TopologyType::Unknown
    }
}

/// The current, up-to-date view of a deployment's topology, as maintained by SDAM.
#[derive(Debug, Clone)]
pub(crate) struct TopologyDescription {
    /// Whether this topology was initialized from a single seed address.
    single_seed: bool,

    /// The current type of the topology.
    pub(crate) topology_type: TopologyType,

    /// The replica set name of the topology, once known.
    set_name: Option<String>,

    /// The highest replica set config version the driver has seen from any member.
    max_set_version: Option<i32>,

    /// The highest replica set election id the driver has seen from any member.
    max_election_id: Option<ObjectId>,

    /// Describes the compatibility issue between the driver and the servers with regards to
    /// wire version, if one has been detected.
    compatibility_error: Option<String>,

    /// The smallest `logicalSessionTimeoutMinutes` reported by any data-bearing server.
    logical_session_timeout: Option<Duration>,

    /// How often a server in this topology is actively probed with `hello`.
    heartbeat_freq: Duration,

    /// The RTT window, relative to the fastest candidate, within which servers are considered
    /// equally preferable for server selection.
    local_threshold: Duration,

    /// The server descriptions of each member of the topology, keyed by address.
    servers: HashMap<ServerAddress, ServerDescription>,
}

impl TopologyDescription {
    pub(crate) fn new(options: &ClientOptions) -> Self {
        let topology_type = if let Some(true) = options.load_balanced {
            TopologyType::Single
        } else {
            TopologyType::Unknown
        };

        let servers: HashMap<_, _> = options
            .hosts
            .iter()
            .cloned()
            .map(|address| (address.clone(), ServerDescription::new(address)))
            .collect();

        Self {
            single_seed: servers.len() == 1,
            topology_type,
            set_name: None,
            max_set_version: None,
            max_election_id: None,
            compatibility_error: None,
            logical_session_timeout: None,
            heartbeat_freq: options.server_selection_options.heartbeat_freq,
            local_threshold: options.server_selection_options.local_threshold,
            servers,
        }
    }

    pub(crate) fn servers(&self) -> impl Iterator<Item = &ServerDescription> {
        self.servers.values()
    }

    pub(crate) fn addresses(&self) -> impl Iterator<Item = &ServerAddress> {
        self.servers.keys()
    }

    pub(crate) fn compatibility_error(&self) -> Option<&String> {
        self.compatibility_error.as_ref()
    }

    /// Annotates a command with `$readPreference` when the topology type/server combination
    /// requires it, following the same rules the server selection spec lays out for routing
    /// through mongos and load balancers.
    pub(crate) fn update_command_with_read_pref(
        &self,
        server_type: ServerType,
        command: &mut Command,
        criteria: Option<&SelectionCriteria>,
    ) {
        match (self.topology_type, server_type) {
            (TopologyType::Sharded, ServerType::Mongos)
            | (TopologyType::Single, ServerType::Mongos) => {
                self.update_command_read_pref_for_mongos(command, criteria);
            }
            (TopologyType::Single, ServerType::Standalone) => {}
            (TopologyType::Single, _) => {
                command.set_read_preference(
                    criteria
                        .and_then(SelectionCriteria::as_read_pref)
                        .cloned()
                        .unwrap_or_else(ReadPreference::primary_preferred),
                );
            }
            _ => {}
        }
    }

    fn update_command_read_pref_for_mongos(
        &self,
        command: &mut Command,
        criteria: Option<&SelectionCriteria>,
    ) {
        match criteria.and_then(SelectionCriteria::as_read_pref) {
            Some(ReadPreference::Primary) | None => {}
            Some(ReadPreference::SecondaryPreferred {
                max_staleness: None,
                tag_sets: None,
            }) => {}
            Some(read_pref) => command.set_read_preference(read_pref.clone()),
        }
    }

    fn check_compatibility(&mut self) {
        for server in self.servers.values() {
            let error_message = server.compatibility_error_message();

            if error_message.is_some() {
                self.compatibility_error = error_message;
                return;
            }
        }
    }

    /// Updates the topology based on a new server description, following the SDAM state
    /// machine transition tables.
    pub(crate) fn update(&mut self, server_description: ServerDescription) -> Result<()> {
        // Ignore updates from servers that are no longer part of this topology (e.g. a stale
        // heartbeat that raced a removal).
        if !self.servers.contains_key(&server_description.address) {
            return Ok(());
        }

        if let Ok(Some(timeout)) = server_description.logical_session_timeout() {
            self.logical_session_timeout = Some(match self.logical_session_timeout {
                Some(existing) => existing.min(timeout),
                None => timeout,
            });
        } else {
            self.logical_session_timeout = None;
        }

        self.servers.insert(
            server_description.address.clone(),
            server_description.clone(),
        );

        match self.topology_type {
            TopologyType::Single => {}
            TopologyType::Unknown => self.update_unknown_topology(server_description)?,
            TopologyType::Sharded => self.update_sharded_topology(server_description),
            TopologyType::ReplicaSetNoPrimary => {
                self.update_replica_set_no_primary_topology(server_description)?
            }
            TopologyType::ReplicaSetWithPrimary => {
                self.update_replica_set_with_primary_topology(server_description)?
            }
        }

        self.check_compatibility();

        Ok(())
    }

    fn update_unknown_topology(&mut self, server_description: ServerDescription) -> Result<()> {
        match server_description.server_type {
            ServerType::Unknown | ServerType::RsGhost => {}
            ServerType::Standalone => self.update_unknown_with_standalone_server(server_description),
            ServerType::Mongos => self.topology_type = TopologyType::Sharded,
            ServerType::RsPrimary => self.update_rs_from_primary_server(server_description)?,
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                self.update_rs_without_primary_server(server_description)?;
            }
            ServerType::LoadBalancer => {}
        }

        Ok(())
    }

    fn update_sharded_topology(&mut self, server_description: ServerDescription) {
        match server_description.server_type {
            ServerType::Unknown | ServerType::Mongos => {}
            _ => {
                self.servers.remove(&server_description.address);
            }
        }
    }

    fn update_replica_set_no_primary_topology(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        match server_description.server_type {
            ServerType::Unknown | ServerType::RsGhost => {}
            ServerType::Standalone | ServerType::Mongos => {
                self.servers.remove(&server_description.address);
            }
            ServerType::RsPrimary => self.update_rs_from_primary_server(server_description)?,
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                self.update_rs_without_primary_server(server_description)?;
            }
            ServerType::LoadBalancer => {}
        }

        Ok(())
    }

    fn update_replica_set_with_primary_topology(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        match server_description.server_type {
            ServerType::Unknown | ServerType::RsGhost => {
                self.record_primary_state();
            }
            ServerType::Standalone | ServerType::Mongos => {
                self.servers.remove(&server_description.address);
                self.record_primary_state();
            }
            ServerType::RsPrimary => self.update_rs_from_primary_server(server_description)?,
            ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther => {
                self.update_rs_with_primary_from_member(server_description)?;
            }
            ServerType::LoadBalancer => {}
        }

        Ok(())
    }

    fn update_unknown_with_standalone_server(&mut self, server_description: ServerDescription) {
        if self.single_seed {
            self.topology_type = TopologyType::Single;
        } else {
            self.servers.remove(&server_description.address);
        }
    }

    fn update_rs_without_primary_server(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        if self.set_name.is_none() {
            self.set_name = server_description.set_name()?;
        } else if self.set_name != server_description.set_name()? {
            self.servers.remove(&server_description.address);
            return Ok(());
        }

        self.add_new_servers(server_description.known_hosts()?)?;

        if server_description.invalid_me()? {
            self.servers.remove(&server_description.address);
        }

        Ok(())
    }

    fn update_rs_with_primary_from_member(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        if self.set_name != server_description.set_name()? {
            self.servers.remove(&server_description.address);
            self.record_primary_state();
            return Ok(());
        }

        if server_description.invalid_me()? {
            self.servers.remove(&server_description.address);
            self.record_primary_state();
        }

        Ok(())
    }

    fn update_rs_from_primary_server(
        &mut self,
        server_description: ServerDescription,
    ) -> Result<()> {
        if self.set_name.is_none() {
            self.set_name = server_description.set_name()?;
        } else if self.set_name != server_description.set_name()? {
            self.servers.remove(&server_description.address);
            self.record_primary_state();
            return Ok(());
        }

        // Stale-primary detection: a primary whose (setVersion, electionId) pair is older than
        // the newest one this topology has already observed is demoted back to Unknown instead
        // of being trusted, since a newer primary has already been elected.
        if let (Some(server_set_version), Some(server_election_id)) = (
            server_description.set_version()?,
            server_description.election_id()?,
        ) {
            if let (Some(topology_max_set_version), Some(topology_max_election_id)) =
                (self.max_set_version, self.max_election_id.as_ref())
            {
                if topology_max_set_version > server_set_version
                    || (topology_max_set_version == server_set_version
                        && *topology_max_election_id > server_election_id)
                {
                    self.servers.insert(
                        server_description.address.clone(),
                        ServerDescription::new(server_description.address),
                    );
                    self.record_primary_state();
                    return Ok(());
                }
            }

            self.max_election_id = Some(server_election_id);
        }

        if let Some(server_set_version) = server_description.set_version()? {
            if self
                .max_set_version
                .map(|existing| server_set_version > existing)
                .unwrap_or(true)
            {
                self.max_set_version = Some(server_set_version);
            }
        }

        let addresses: Vec<_> = self.servers.keys().cloned().collect();

        // Any other server currently believed to be primary must be demoted: there can only be
        // one primary at a time, and this reply is the newest information we have.
        for address in &addresses {
            if *address == server_description.address {
                continue;
            }

            if let Some(ServerType::RsPrimary) =
                self.servers.get(address).map(|s| s.server_type)
            {
                self.servers
                    .insert(address.clone(), ServerDescription::new(address.clone()));
            }
        }

        self.add_new_servers(server_description.known_hosts()?)?;
        let known_hosts: HashSet<_> = server_description
            .known_hosts()?
            .into_iter()
            .collect();

        for address in addresses {
            if !known_hosts.contains(&address.to_string()) {
                self.servers.remove(&address);
            }
        }

        self.record_primary_state();

        Ok(())
    }

    /// Recomputes whether this topology currently has a primary, demoting it back to
    /// `ReplicaSetNoPrimary` if not. Only valid to call on a replica-set topology.
    fn record_primary_state(&mut self) {
        self.topology_type = if self
            .servers
            .values()
            .any(|server| server.server_type == ServerType::RsPrimary)
        {
            TopologyType::ReplicaSetWithPrimary
        } else {
            TopologyType::ReplicaSetNoPrimary
        };
    }

    fn add_new_servers(&mut self, hosts: impl IntoIterator<Item = String>) -> Result<()> {
        for host in hosts {
            let address = ServerAddress::parse(&host)?;

            if !self.servers.contains_key(&address) {
                self.servers
                    .insert(address.clone(), ServerDescription::new(address));
            }
        }

        Ok(())
    }
}

impl TopologyDescription {
    /// Selects a single server satisfying `criteria`, chosen uniformly at random from the set
    /// of equally-suitable candidates within the latency window.
    pub(crate) fn select_server<'a>(
        &'a self,
        criteria: &'a SelectionCriteria,
    ) -> Result<Option<&'a ServerDescription>> {
        if let Some(max_staleness) = criteria.max_staleness() {
            if max_staleness < MIN_MAX_STALENESS {
                return Err(ErrorKind::InvalidArgument {
                    message: format!(
                        "max staleness must be at least {} seconds, got {}",
                        MIN_MAX_STALENESS.as_secs(),
                        max_staleness.as_secs()
                    ),
                }
                .into());
            }
        }

        if let TopologyType::Unknown = self.topology_type {
            return Ok(None);
        }

        if let TopologyType::Single = self.topology_type {
            return Ok(self.servers.values().next());
        }

        let mut suitable_servers = match criteria {
            SelectionCriteria::ReadPreference(ref read_pref) => {
                self.suitable_servers(read_pref)?
            }
            SelectionCriteria::Predicate(ref filter) => {
                self.servers.values().filter(|s| filter(s)).collect()
            }
        };

        if !criteria.is_read_pref_primary() {
            self.retain_servers_within_latency_window(&mut suitable_servers);
        }

        Ok(suitable_servers.into_iter().choose(&mut rand::rng()))
    }

    fn suitable_servers<'a>(
        &'a self,
        read_preference: &'a ReadPreference,
    ) -> Result<Vec<&'a ServerDescription>> {
        Ok(match self.topology_type {
            TopologyType::Unknown => Vec::new(),
            TopologyType::Single => self.servers.values().collect(),
            TopologyType::Sharded => self.servers_with_type(&[ServerType::Mongos]).collect(),
            TopologyType::ReplicaSetWithPrimary | TopologyType::ReplicaSetNoPrimary => {
                self.suitable_servers_in_replica_set(read_preference)?
            }
        })
    }

    fn retain_servers_within_latency_window<'a>(
        &self,
        suitable_servers: &mut Vec<&'a ServerDescription>,
    ) {
        let shortest_average_rtt = suitable_servers
            .iter()
            .filter_map(|server| server.average_round_trip_time_ms)
            .fold(Option::<f64>::None, |min, curr| match min {
                Some(prev) => Some(prev.min(curr)),
                None => Some(curr),
            });

        let max_rtt_within_window =
            shortest_average_rtt.map(|rtt| rtt + self.local_threshold.as_millis() as f64);

        suitable_servers.retain(|server| match server.average_round_trip_time_ms {
            Some(server_rtt) => match max_rtt_within_window {
                Some(max_rtt) => server_rtt <= max_rtt,
                None => false,
            },
            None => false,
        });
    }

    fn servers_with_type<'a>(
        &'a self,
        types: &'a [ServerType],
    ) -> impl Iterator<Item = &'a ServerDescription> {
        self.servers
            .values()
            .filter(move |server| types.contains(&server.server_type))
    }

    fn suitable_servers_in_replica_set<'a>(
        &'a self,
        read_preference: &'a ReadPreference,
    ) -> Result<Vec<&'a ServerDescription>> {
        Ok(match read_preference {
            ReadPreference::Primary => self.servers_with_type(&[ServerType::RsPrimary]).collect(),
            ReadPreference::Secondary {
                ref tag_sets,
                max_staleness,
            } => self.suitable_servers_for_read_preference(
                &[ServerType::RsSecondary],
                tag_sets.as_ref(),
                *max_staleness,
            )?,
            ReadPreference::PrimaryPreferred {
                ref tag_sets,
                max_staleness,
            } => match self.servers_with_type(&[ServerType::RsPrimary]).next() {
                Some(primary) => vec![primary],
                None => self.suitable_servers_for_read_preference(
                    &[ServerType::RsSecondary],
                    tag_sets.as_ref(),
                    *max_staleness,
                )?,
            },
            ReadPreference::SecondaryPreferred {
                ref tag_sets,
                max_staleness,
            } => {
                let suitable = self.suitable_servers_for_read_preference(
                    &[ServerType::RsSecondary],
                    tag_sets.as_ref(),
                    *max_staleness,
                )?;

                if suitable.is_empty() {
                    self.servers_with_type(&[ServerType::RsPrimary]).collect()
                } else {
                    suitable
                }
            }
            ReadPreference::Nearest {
                ref tag_sets,
                max_staleness,
            } => self.suitable_servers_for_read_preference(
                &[ServerType::RsPrimary, ServerType::RsSecondary],
                tag_sets.as_ref(),
                *max_staleness,
            )?,
        })
    }

    fn suitable_servers_for_read_preference<'a>(
        &'a self,
        types: &'a [ServerType],
        tag_sets: Option<&'a Vec<TagSet>>,
        max_staleness: Option<Duration>,
    ) -> Result<Vec<&'a ServerDescription>> {
        let mut servers: Vec<_> = self.servers_with_type(types).collect();

        if let Some(tag_sets) = tag_sets {
            filter_servers_by_tag_sets(&mut servers, tag_sets);
        }

        if let Some(max_staleness) = max_staleness {
            self.filter_servers_by_max_staleness(&mut servers, max_staleness)?;
        }

        Ok(servers)
    }

    /// Drops candidates whose computed staleness exceeds `max_staleness`.
    ///
    /// With a known primary, a secondary's staleness is
    /// `(primary.lastWriteDate - secondary.lastWriteDate) + heartbeatFrequency`. With no known
    /// primary, there's no primary write time to diff against, so the spec instead diffs each
    /// secondary against the most up-to-date secondary in the candidate set:
    /// `(maxSecondaryLastWriteDate - secondary.lastWriteDate) + heartbeatFrequency`.
    fn filter_servers_by_max_staleness(
        &self,
        servers: &mut Vec<&ServerDescription>,
        max_staleness: Duration,
    ) -> Result<()> {
        let reference_write_date = match self.topology_type {
            TopologyType::ReplicaSetWithPrimary => self
                .servers
                .values()
                .find(|s| s.server_type == ServerType::RsPrimary)
                .and_then(|primary| primary.last_write_date().ok().flatten()),
            _ => servers
                .iter()
                .filter_map(|s| s.last_write_date().ok().flatten())
                .max(),
        };

        let reference_write_date = match reference_write_date {
            Some(date) => date,
            // No secondary (or primary) has reported a write time yet; nothing can be judged
            // stale, so every candidate passes.
            None => return Ok(()),
        };

        let heartbeat_freq = self.heartbeat_freq;

        let mut error = None;
        servers.retain(|server| {
            let last_write_date = match server.last_write_date() {
                Ok(date) => date,
                Err(e) => {
                    error.get_or_insert(e);
                    return false;
                }
            };

            let last_write_date = match last_write_date {
                Some(date) => date,
                None => return false,
            };

            let staleness_ms = (reference_write_date.timestamp_millis()
                - last_write_date.timestamp_millis())
            .max(0) as u64
                + heartbeat_freq.as_millis() as u64;

            Duration::from_millis(staleness_ms) <= max_staleness
        });

        if let Some(e) = error {
            return Err(e);
        }

        Ok(())
    }
}

fn filter_servers_by_tag_sets(servers: &mut Vec<&ServerDescription>, tag_sets: &[TagSet]) {
    if tag_sets.is_empty() {
        return;
    }

    for tag_set in tag_sets {
        let matches_tag_set = |server: &&ServerDescription| server.matches_tag_set(tag_set);

        if servers.iter().any(matches_tag_set) {
            servers.retain(matches_tag_set);
            return;
        }
    }

    servers.clear();
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hello::{HelloCommandResponse, HelloReply};

    fn address(port: u16) -> ServerAddress {
        ServerAddress::parse(&format!("localhost:{}", port)).unwrap()
    }

    fn secondary_desc(port: u16, rtt_ms: f64, last_write_secs_ago: i64) -> ServerDescription {
        let mut response = HelloCommandResponse::default();
        response.set_name = Some("rs0".to_string());
        response.secondary = Some(true);
        response.min_wire_version = Some(0);
        response.max_wire_version = Some(17);
        response.last_write = Some(crate::hello::LastWrite {
            last_write_date: bson::DateTime::from_millis(
                bson::DateTime::now().timestamp_millis() - last_write_secs_ago * 1000,
            ),
        });

        let reply = HelloReply {
            server_address: address(port),
            command_response: response,
        };

        ServerDescription::new_from_hello_reply(address(port), reply, rtt_ms, None)
    }

    fn topology_with_secondaries(descs: Vec<ServerDescription>) -> TopologyDescription {
        let servers = descs.into_iter().map(|d| (d.address.clone(), d)).collect();
        TopologyDescription {
            single_seed: false,
            topology_type: TopologyType::ReplicaSetNoPrimary,
            set_name: Some("rs0".to_string()),
            max_set_version: None,
            max_election_id: None,
            compatibility_error: None,
            logical_session_timeout: None,
            heartbeat_freq: Duration::from_secs(10),
            local_threshold: Duration::from_millis(15),
            servers,
        }
    }

    #[test]
    fn max_staleness_below_minimum_is_rejected() {
        let topology = topology_with_secondaries(vec![secondary_desc(27017, 1.0, 0)]);
        let criteria: SelectionCriteria = ReadPreference::Secondary {
            tag_sets: None,
            max_staleness: Some(Duration::from_secs(1)),
        }
        .into();

        assert!(topology.select_server(&criteria).is_err());
    }

    #[test]
    fn max_staleness_with_no_primary_uses_freshest_secondary_as_reference() {
        // S1 just wrote; S2 is 120s behind. heartbeatFreq=10s, maxStaleness=90s.
        // S2's staleness = 120 + 10 = 130s > 90s, so only S1 should survive.
        let topology =
            topology_with_secondaries(vec![secondary_desc(27017, 1.0, 0), secondary_desc(27018, 1.0, 120)]);

        let mut servers: Vec<_> = topology.servers.values().collect();
        topology
            .filter_servers_by_max_staleness(&mut servers, Duration::from_secs(90))
            .unwrap();

        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].address, address(27017));
    }

    #[test]
    fn tag_set_filter_picks_first_matching_set() {
        let mut tagged = secondary_desc(27017, 1.0, 0);
        if let Ok(Some(ref mut reply)) = tagged.reply {
            let mut tags = TagSet::new();
            tags.insert("region".to_string(), "east".to_string());
            reply.command_response.tags = Some(tags);
        }

        let untagged = secondary_desc(27018, 1.0, 0);

        let mut servers = vec![&tagged, &untagged];
        let mut region_west = TagSet::new();
        region_west.insert("region".to_string(), "west".to_string());
        let mut region_east = TagSet::new();
        region_east.insert("region".to_string(), "east".to_string());

        filter_servers_by_tag_sets(&mut servers, &[region_west, region_east]);

        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].address, address(27017));
    }
}
