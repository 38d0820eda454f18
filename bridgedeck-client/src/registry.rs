use std::collections::BTreeSet;

use bridgedeck_core::{
    ApiError, ConnectAck, ConnectionEvent, ConnectionState, EventKind, InstanceId,
    InstanceSummary, StatusRecord,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: InstanceId,
    pub name: String,
    /// Only populated while the instance is authenticated.
    pub phone: Option<String>,
    pub state: ConnectionState,
    pub webhook: Option<String>,
    pub events: BTreeSet<EventKind>,
    /// Last probe said the remote session is gone; the next connect asks
    /// for a clean session.
    pub session_absent: bool,
}

impl Instance {
    pub fn new(id: impl Into<InstanceId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            phone: None,
            state: ConnectionState::Disconnected,
            webhook: None,
            events: BTreeSet::new(),
            session_absent: false,
        }
    }

    pub fn from_summary(summary: InstanceSummary) -> Self {
        let state = summary.state();
        Self {
            phone: summary.phone.filter(|_| state.is_authenticated()),
            id: summary.id,
            name: summary.name,
            state,
            webhook: summary.webhook,
            events: summary.events,
            session_absent: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
}

impl StateChange {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

/// Known instances in listing order, plus the current selection.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: Vec<Instance>,
    selected: Option<InstanceId>,
}

impl InstanceRegistry {
    pub fn list(&self) -> &[Instance] {
        &self.instances
    }

    pub fn get(&self, id: &str) -> Option<&Instance> {
        self.instances.iter().find(|instance| instance.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Instance> {
        self.instances.iter_mut().find(|instance| instance.id == id)
    }

    pub fn require(&self, id: &str) -> Result<&Instance, ApiError> {
        self.get(id)
            .ok_or_else(|| ApiError::UnknownInstance(id.to_owned()))
    }

    pub fn state_of(&self, id: &str) -> Option<ConnectionState> {
        self.get(id).map(|instance| instance.state)
    }

    pub fn first_id(&self) -> Option<&str> {
        self.instances.first().map(|instance| instance.id.as_str())
    }

    /// Replaces the listing. Local session flags survive for identifiers
    /// that are still present; a vanished selection is dropped.
    pub fn replace_all(&mut self, summaries: Vec<InstanceSummary>) {
        let mut next: Vec<Instance> = Vec::with_capacity(summaries.len());
        for summary in summaries {
            if next.iter().any(|existing| existing.id == summary.id) {
                continue;
            }
            let mut instance = Instance::from_summary(summary);
            if let Some(previous) = self.get(&instance.id) {
                instance.session_absent = previous.session_absent;
            }
            next.push(instance);
        }
        self.instances = next;

        if let Some(selected) = &self.selected
            && self.get(selected).is_none()
        {
            self.selected = None;
        }
    }

    pub fn upsert(&mut self, instance: Instance) {
        match self.get_mut(&instance.id) {
            Some(existing) => *existing = instance,
            None => self.instances.push(instance),
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Instance> {
        let index = self.instances.iter().position(|instance| instance.id == id)?;
        if self.selected.as_deref() == Some(id) {
            self.selected = None;
        }
        Some(self.instances.remove(index))
    }

    pub fn clear(&mut self) {
        self.instances.clear();
        self.selected = None;
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn is_selected(&self, id: &str) -> bool {
        self.selected.as_deref() == Some(id)
    }

    pub fn select(&mut self, id: &str) -> Result<(), ApiError> {
        self.require(id)?;
        self.selected = Some(id.to_owned());
        Ok(())
    }

    pub fn deselect(&mut self) -> Option<InstanceId> {
        self.selected.take()
    }

    pub fn apply_event(&mut self, id: &str, event: ConnectionEvent) -> Option<StateChange> {
        let instance = self.get_mut(id)?;
        let previous = instance.state;
        instance.state = previous.apply(event);
        if !instance.state.is_authenticated() {
            instance.phone = None;
        }
        Some(StateChange {
            previous,
            current: instance.state,
        })
    }

    pub fn apply_status(&mut self, id: &str, record: &StatusRecord) -> Option<StateChange> {
        let change = self.apply_event(id, ConnectionEvent::Probed(record.clone()))?;
        let instance = self.get_mut(id)?;
        instance.session_absent = record.needs_session_reset();
        if change.current.is_authenticated() && record.phone.is_some() {
            instance.phone = record.phone.clone();
        }
        Some(change)
    }

    /// Restores a cached state without a probe. Used for fresh snapshots.
    pub fn apply_cached(
        &mut self,
        id: &str,
        state: ConnectionState,
        phone: Option<String>,
    ) -> Option<StateChange> {
        let instance = self.get_mut(id)?;
        let previous = instance.state;
        instance.state = state;
        instance.phone = phone.filter(|_| state.is_authenticated());
        Some(StateChange {
            previous,
            current: state,
        })
    }

    pub fn merge_ack(&mut self, id: &str, ack: ConnectAck) {
        let Some(instance) = self.get_mut(id) else {
            return;
        };
        if let Some(webhook) = ack.webhook {
            instance.webhook = Some(webhook);
        }
        if let Some(events) = ack.events.filter(|events| !events.is_empty()) {
            instance.events = events;
        }
        if instance.state.is_authenticated() && ack.phone.is_some() {
            instance.phone = ack.phone;
        }
    }

    pub fn mark_session_reset(&mut self, id: &str) {
        if let Some(instance) = self.get_mut(id) {
            instance.session_absent = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use bridgedeck_core::StatusOrigin;
    use serde_json::json;

    use super::*;

    fn registry() -> InstanceRegistry {
        let payload = json!([
            {"id": "1", "name": "one", "connected": true, "loggedIn": true, "phone": "5511"},
            {"id": 2, "name": "two", "connected": true, "loggedIn": false, "phone": "5522"},
            {"id": "1", "name": "dupe"}
        ]);
        let mut registry = InstanceRegistry::default();
        registry.replace_all(InstanceSummary::list_from_payload(&payload).unwrap());
        registry
    }

    #[test]
    fn listing_dedupes_and_only_trusts_phone_when_authenticated() {
        let registry = registry();
        assert_eq!(registry.list().len(), 2);
        assert_eq!(registry.get("1").unwrap().phone.as_deref(), Some("5511"));
        assert_eq!(registry.get("2").unwrap().phone, None);
        assert_eq!(registry.first_id(), Some("1"));
    }

    #[test]
    fn selection_requires_a_known_instance_and_survives_refresh() {
        let mut registry = registry();
        assert_eq!(
            registry.select("9"),
            Err(ApiError::UnknownInstance("9".to_owned()))
        );
        registry.select("2").unwrap();

        let payload = json!([{"id": "2", "name": "two"}]);
        registry.replace_all(InstanceSummary::list_from_payload(&payload).unwrap());
        assert_eq!(registry.selected(), Some("2"));

        registry.replace_all(Vec::new());
        assert_eq!(registry.selected(), None);
    }

    #[test]
    fn session_absent_probe_sets_flag_and_clears_phone() {
        let mut registry = registry();
        let change = registry
            .apply_status("1", &StatusRecord::session_absent())
            .unwrap();
        assert_eq!(change.previous, ConnectionState::Authenticated);
        assert_eq!(change.current, ConnectionState::Disconnected);

        let instance = registry.get("1").unwrap();
        assert!(instance.session_absent);
        assert_eq!(instance.phone, None);

        registry.mark_session_reset("1");
        assert!(!registry.get("1").unwrap().session_absent);
    }

    #[test]
    fn remote_probe_carries_phone_once_paired() {
        let mut registry = registry();
        let record = StatusRecord {
            connected: true,
            logged_in: true,
            phone: Some("5599".to_owned()),
            origin: StatusOrigin::Remote,
        };
        registry.apply_status("2", &record);
        assert_eq!(registry.get("2").unwrap().phone.as_deref(), Some("5599"));
    }

    #[test]
    fn removing_selected_instance_clears_selection() {
        let mut registry = registry();
        registry.select("1").unwrap();
        assert!(registry.remove("1").is_some());
        assert_eq!(registry.selected(), None);
        assert!(registry.remove("1").is_none());
    }
}
