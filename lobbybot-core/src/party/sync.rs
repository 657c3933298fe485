// lobbybot-core/src/party/sync.rs
//
// In-memory party synchronizer. Keeps one eventually-consistent snapshot
// per tracked account, fed by stream deltas and repaired by authoritative
// re-fetches. Several tracked accounts in the same party each hold their
// own copy; a delta is applied to every copy of that party.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, warn};

use lobbybot_common::models::{AccountIdentity, MemberRole, PartyMember, PartySnapshot};
use lobbybot_common::traits::PartyApi;

use crate::stream::events::{MemberEvent, PartyUpdatedEvent};
use crate::stream::StreamEvent;
use crate::Error;

pub struct PartySynchronizer {
    api: Arc<dyn PartyApi>,
    tracked: DashMap<String, AccountIdentity>,
    /// Snapshots keyed by the tracked account's id, not the party id.
    snapshots: DashMap<String, PartySnapshot>,
}

impl PartySynchronizer {
    pub fn new(api: Arc<dyn PartyApi>) -> Arc<Self> {
        Arc::new(Self {
            api,
            tracked: DashMap::new(),
            snapshots: DashMap::new(),
        })
    }

    /// Start tracking an account and seed its snapshot from the backend.
    pub async fn track(&self, account: &AccountIdentity) -> Result<Option<PartySnapshot>, Error> {
        self.tracked
            .insert(account.account_id.clone(), account.clone());
        self.refresh(account).await
    }

    pub fn untrack(&self, account_id: &str) {
        self.tracked.remove(account_id);
        self.snapshots.remove(account_id);
    }

    pub fn snapshot(&self, account_id: &str) -> Option<PartySnapshot> {
        self.snapshots.get(account_id).map(|s| s.value().clone())
    }

    /// Drop the cached snapshot without untracking the account.
    pub fn discard(&self, account_id: &str) {
        self.snapshots.remove(account_id);
    }

    /// Authoritative re-fetch, replacing the cached snapshot wholesale.
    pub async fn refresh(&self, account: &AccountIdentity) -> Result<Option<PartySnapshot>, Error> {
        match self.api.fetch_party(account).await? {
            Some(snapshot) => {
                self.snapshots
                    .insert(account.account_id.clone(), snapshot.clone());
                Ok(Some(snapshot))
            }
            None => {
                self.snapshots.remove(&account.account_id);
                Ok(None)
            }
        }
    }

    /// Apply one stream delta to every cached copy of the affected party.
    pub async fn handle_event(&self, event: &StreamEvent) {
        match event {
            StreamEvent::MemberJoined(evt) => {
                self.for_party(&evt.party_id, |snap| apply_member_joined(snap, evt));
                // A tracked account joining a party needs a full re-fetch:
                // the join delta alone cannot rebuild the roster it walked
                // into.
                if let Some(account) = self.tracked.get(&evt.account_id).map(|a| a.value().clone())
                {
                    if let Err(e) = self.refresh(&account).await {
                        warn!(
                            account = %account.account_id,
                            error = %e,
                            "post-join party refresh failed"
                        );
                    }
                }
            }
            StreamEvent::MemberLeft(evt)
            | StreamEvent::MemberKicked(evt)
            | StreamEvent::MemberExpired(evt) => {
                let mut gone = Vec::new();
                for mut entry in self.snapshots.iter_mut() {
                    if entry.value().party_id != evt.party_id {
                        continue;
                    }
                    if entry.key() == &evt.account_id {
                        // The tracked account itself left; its snapshot is
                        // now meaningless.
                        gone.push(entry.key().clone());
                    } else {
                        apply_member_gone(entry.value_mut(), evt);
                    }
                }
                for account_id in gone {
                    debug!(account = %account_id, party = %evt.party_id, "left party");
                    self.snapshots.remove(&account_id);
                }
            }
            StreamEvent::MemberStateUpdated(evt)
            | StreamEvent::MemberConnected(evt)
            | StreamEvent::MemberDisconnected(evt) => {
                self.for_party(&evt.party_id, |snap| apply_member_state(snap, evt));
            }
            StreamEvent::MemberNewCaptain(evt) => {
                self.for_party(&evt.party_id, |snap| apply_new_captain(snap, evt));
            }
            StreamEvent::PartyUpdated(evt) => {
                self.for_party(&evt.party_id, |snap| apply_party_updated(snap, evt));
            }
            _ => {}
        }
    }

    /// Patch party metadata (`member = false`) or the calling account's own
    /// member metadata (`member = true`). A stale-revision rejection is
    /// retried exactly once at the revision the backend reports.
    pub async fn patch(
        &self,
        account: &AccountIdentity,
        updates: &HashMap<String, String>,
        member: bool,
    ) -> Result<(), Error> {
        let mut retried = false;
        loop {
            let snapshot = self
                .snapshot(&account.account_id)
                .ok_or_else(|| Error::Action(format!("{} is not in a party", account.account_id)))?;

            match self
                .api
                .patch_party(account, &snapshot.party_id, snapshot.revision, updates, member)
                .await
            {
                Ok(()) => {
                    if let Some(mut snap) = self.snapshots.get_mut(&account.account_id) {
                        // An event delta may have landed while the call was in
                        // flight; never move the revision backwards.
                        snap.revision = snap.revision.max(snapshot.revision + 1);
                        if member {
                            let account_id = account.account_id.clone();
                            if let Some(me) =
                                snap.members.iter_mut().find(|m| m.account_id == account_id)
                            {
                                me.meta
                                    .extend(updates.iter().map(|(k, v)| (k.clone(), v.clone())));
                                me.updated_at = Utc::now();
                            }
                        } else {
                            snap.meta
                                .extend(updates.iter().map(|(k, v)| (k.clone(), v.clone())));
                        }
                    }
                    return Ok(());
                }
                Err(Error::StaleRevision { current }) if !retried => {
                    debug!(
                        account = %account.account_id,
                        revision = current,
                        "patch raced a concurrent update, retrying once"
                    );
                    retried = true;
                    if let Some(mut snap) = self.snapshots.get_mut(&account.account_id) {
                        snap.revision = current;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn kick(&self, account: &AccountIdentity, target_id: &str) -> Result<(), Error> {
        let snapshot = self
            .snapshot(&account.account_id)
            .ok_or_else(|| Error::Action(format!("{} is not in a party", account.account_id)))?;
        self.api
            .kick_member(account, &snapshot.party_id, target_id)
            .await
    }

    pub async fn leave(&self, account: &AccountIdentity) -> Result<(), Error> {
        let snapshot = self
            .snapshot(&account.account_id)
            .ok_or_else(|| Error::Action(format!("{} is not in a party", account.account_id)))?;
        self.api.leave_party(account, &snapshot.party_id).await?;
        self.snapshots.remove(&account.account_id);
        Ok(())
    }

    pub async fn invite(&self, account: &AccountIdentity, target_id: &str) -> Result<(), Error> {
        let snapshot = self
            .snapshot(&account.account_id)
            .ok_or_else(|| Error::Action(format!("{} is not in a party", account.account_id)))?;
        self.api
            .invite_member(account, &snapshot.party_id, target_id)
            .await
    }

    /// Accept an inviter's pending invite and join their party. Returns the
    /// freshly fetched snapshot of the joined party.
    pub async fn join_inviter(
        &self,
        account: &AccountIdentity,
        inviter_id: &str,
        connection_ref: &str,
        joining_meta: &HashMap<String, String>,
    ) -> Result<PartySnapshot, Error> {
        let party = self
            .api
            .fetch_inviter_party(account, inviter_id)
            .await?
            .ok_or_else(|| Error::Action(format!("{inviter_id} has no joinable party")))?;
        self.api
            .accept_invite(account, &party.party_id, inviter_id, connection_ref, joining_meta)
            .await?;
        self.refresh(account)
            .await?
            .ok_or_else(|| Error::Action("party vanished right after joining".to_string()))
    }

    fn for_party<F>(&self, party_id: &str, mut apply: F)
    where
        F: FnMut(&mut PartySnapshot),
    {
        for mut entry in self.snapshots.iter_mut() {
            if entry.value().party_id == party_id {
                apply(entry.value_mut());
            }
        }
    }
}

/// Merge a member-scoped delta into the snapshot. Removal wins first, then
/// updates, then overrides; the party revision never moves backwards.
fn apply_member_state(snapshot: &mut PartySnapshot, evt: &MemberEvent) {
    if let Some(member) = snapshot
        .members
        .iter_mut()
        .find(|m| m.account_id == evt.account_id)
    {
        for key in &evt.member_state_removed {
            member.meta.remove(key);
        }
        for (key, value) in &evt.member_state_updated {
            member.meta.insert(key.clone(), value.clone());
        }
        for (key, value) in &evt.member_state_overridden {
            member.meta.insert(key.clone(), value.clone());
        }
        member.updated_at = evt.updated_at.unwrap_or_else(Utc::now);
    }
    snapshot.revision = snapshot.revision.max(evt.revision);
}

fn apply_member_joined(snapshot: &mut PartySnapshot, evt: &MemberEvent) {
    if snapshot.member(&evt.account_id).is_none() {
        let mut meta = evt.member_state_updated.clone();
        meta.extend(
            evt.member_state_overridden
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        snapshot.members.push(PartyMember {
            account_id: evt.account_id.clone(),
            display_name: evt.account_dn.clone(),
            role: MemberRole::Member,
            meta,
            joined_at: evt.joined_at.unwrap_or_else(Utc::now),
            updated_at: evt.updated_at.unwrap_or_else(Utc::now),
        });
    }
    snapshot.revision = snapshot.revision.max(evt.revision);
}

fn apply_member_gone(snapshot: &mut PartySnapshot, evt: &MemberEvent) {
    snapshot.members.retain(|m| m.account_id != evt.account_id);
    snapshot.revision = snapshot.revision.max(evt.revision);
}

fn apply_new_captain(snapshot: &mut PartySnapshot, evt: &MemberEvent) {
    for member in &mut snapshot.members {
        member.role = if member.account_id == evt.account_id {
            MemberRole::Captain
        } else {
            MemberRole::Member
        };
    }
    snapshot.revision = snapshot.revision.max(evt.revision);
}

fn apply_party_updated(snapshot: &mut PartySnapshot, evt: &PartyUpdatedEvent) {
    for key in &evt.party_state_removed {
        snapshot.meta.remove(key);
    }
    for (key, value) in &evt.party_state_updated {
        snapshot.meta.insert(key.clone(), value.clone());
    }
    for (key, value) in &evt.party_state_overridden {
        snapshot.meta.insert(key.clone(), value.clone());
    }

    if evt.party_type.is_some() {
        snapshot.config.party_type = evt.party_type.clone();
    }
    if evt.party_sub_type.is_some() {
        snapshot.config.sub_type = evt.party_sub_type.clone();
    }
    if evt.party_privacy_type.is_some() {
        snapshot.config.privacy = evt.party_privacy_type.clone();
    }
    if evt.max_number_of_members.is_some() {
        snapshot.config.max_size = evt.max_number_of_members;
    }
    if evt.invite_ttl_seconds.is_some() {
        snapshot.config.invite_ttl = evt.invite_ttl_seconds;
    }
    if evt.intention_ttl_seconds.is_some() {
        snapshot.config.intention_ttl = evt.intention_ttl_seconds;
    }

    if !evt.captain_id.is_empty() {
        for member in &mut snapshot.members {
            member.role = if member.account_id == evt.captain_id {
                MemberRole::Captain
            } else {
                MemberRole::Member
            };
        }
    }
    snapshot.revision = snapshot.revision.max(evt.revision);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn member(id: &str, role: MemberRole) -> PartyMember {
        PartyMember {
            account_id: id.to_string(),
            display_name: None,
            role,
            meta: HashMap::new(),
            joined_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn snapshot() -> PartySnapshot {
        PartySnapshot {
            party_id: "party-1".into(),
            revision: 5,
            config: Default::default(),
            meta: HashMap::new(),
            members: vec![
                member("acc-1", MemberRole::Captain),
                member("acc-2", MemberRole::Member),
            ],
        }
    }

    #[test]
    fn state_update_applies_removed_then_updated_then_overridden() {
        let mut snap = snapshot();
        snap.members[1]
            .meta
            .insert("Default:Location_s".into(), "Lobby".into());

        let evt = MemberEvent {
            revision: 6,
            party_id: "party-1".into(),
            account_id: "acc-2".into(),
            member_state_removed: vec!["Default:Location_s".into()],
            member_state_updated: HashMap::from([(
                "Default:Location_s".into(),
                "InGame".into(),
            )]),
            member_state_overridden: HashMap::from([(
                "Default:LobbyState_j".into(),
                "{}".into(),
            )]),
            ..Default::default()
        };
        apply_member_state(&mut snap, &evt);

        let me = snap.member("acc-2").unwrap();
        assert_eq!(me.meta.get("Default:Location_s").unwrap(), "InGame");
        assert_eq!(me.meta.get("Default:LobbyState_j").unwrap(), "{}");
        assert_eq!(snap.revision, 6);
    }

    #[test]
    fn stale_event_never_lowers_revision() {
        let mut snap = snapshot();
        let evt = MemberEvent {
            revision: 2,
            party_id: "party-1".into(),
            account_id: "acc-2".into(),
            ..Default::default()
        };
        apply_member_state(&mut snap, &evt);
        assert_eq!(snap.revision, 5);
    }

    #[test]
    fn joined_appends_once() {
        let mut snap = snapshot();
        let evt = MemberEvent {
            revision: 7,
            party_id: "party-1".into(),
            account_id: "acc-3".into(),
            account_dn: Some("Third".into()),
            ..Default::default()
        };
        apply_member_joined(&mut snap, &evt);
        apply_member_joined(&mut snap, &evt);

        assert_eq!(snap.members.len(), 3);
        assert_eq!(
            snap.member("acc-3").unwrap().display_name.as_deref(),
            Some("Third")
        );
    }

    #[test]
    fn new_captain_demotes_previous_one() {
        let mut snap = snapshot();
        let evt = MemberEvent {
            revision: 8,
            party_id: "party-1".into(),
            account_id: "acc-2".into(),
            ..Default::default()
        };
        apply_new_captain(&mut snap, &evt);

        assert!(snap.is_captain("acc-2"));
        assert!(!snap.is_captain("acc-1"));
    }

    #[test]
    fn party_update_merges_meta_and_config() {
        let mut snap = snapshot();
        snap.meta.insert("Default:Old_s".into(), "x".into());

        let evt = PartyUpdatedEvent {
            revision: 9,
            party_id: "party-1".into(),
            captain_id: "acc-2".into(),
            party_state_removed: vec!["Default:Old_s".into()],
            party_state_updated: HashMap::from([(
                "Default:PartyState_s".into(),
                "PostMatchmaking".into(),
            )]),
            party_privacy_type: Some("PRIVATE".into()),
            ..Default::default()
        };
        apply_party_updated(&mut snap, &evt);

        assert!(snap.meta.get("Default:Old_s").is_none());
        assert_eq!(
            snap.meta.get("Default:PartyState_s").unwrap(),
            "PostMatchmaking"
        );
        assert_eq!(snap.config.privacy.as_deref(), Some("PRIVATE"));
        assert!(snap.is_captain("acc-2"));
        assert_eq!(snap.revision, 9);
    }
}
