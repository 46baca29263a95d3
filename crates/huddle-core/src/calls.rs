//! Call session management.
//!
//! Durable call records live in the store; the manager additionally keeps a
//! transient registry of live (ringing/ongoing) sessions used for busy
//! detection and disconnect cleanup, plus a user-to-calls index so a
//! disconnect never scans every active session.
//!
//! State machine per call:
//!
//! ```text
//! ringing --(first accept)-------> ongoing --(end / disconnect)--> ended
//! ringing --(all reject)---------> rejected
//! ringing --(callee unreachable)-> missed
//! ```
//!
//! Concurrency: every persisted-call mutation happens under that call's
//! session mutex, so two concurrent accepts cannot both observe `ringing`
//! and double-fire the transition. Busy reservation is an atomic
//! check-and-insert against the user index with no await in between.

use crate::error::CoreError;
use crate::presence::PresenceRegistry;
use crate::store::Store;
use crate::types::{
    Call, CallId, CallParticipant, CallStatus, ConversationId, ParticipantStatus, UserId,
};
use chrono::Utc;
use dashmap::DashMap;
use huddle_protocol::{CallKind, ServerEvent};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

/// Transient bookkeeping for one live call; terminal calls have no
/// session at all.
#[derive(Debug)]
struct ActiveSession {
    /// Caller plus every callee still ringing or joined.
    participant_ids: HashSet<UserId>,
}

/// A call initiation request.
#[derive(Debug, Clone)]
pub struct InitiateRequest {
    /// Client-supplied call id; generated when absent.
    pub call_id: Option<CallId>,
    /// Target user for a private call.
    pub user_to_call: Option<UserId>,
    /// Conversation whose participants form the callee set of a group call.
    pub conversation_id: Option<ConversationId>,
    pub is_group: bool,
    pub kind: CallKind,
    /// Opaque WebRTC offer, relayed verbatim.
    pub signal: Value,
}

/// The call session manager.
pub struct CallManager {
    store: Arc<dyn Store>,
    presence: Arc<PresenceRegistry>,
    sessions: DashMap<CallId, Arc<Mutex<ActiveSession>>>,
    /// Index: user -> live calls they participate in.
    by_user: DashMap<UserId, HashSet<CallId>>,
}

impl CallManager {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, presence: Arc<PresenceRegistry>) -> Self {
        Self {
            store,
            presence,
            sessions: DashMap::new(),
            by_user: DashMap::new(),
        }
    }

    /// Whether the user is currently engaged in a live call.
    #[must_use]
    pub fn is_engaged(&self, user_id: &str) -> bool {
        self.by_user.get(user_id).is_some_and(|s| !s.is_empty())
    }

    /// Number of live call sessions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// Initiate a call.
    ///
    /// Busy callees are reported to the caller instead of ringing; offline
    /// callees become `missed` legs with no invitation. When no leg rings
    /// at all the call is persisted terminal (`missed`) and no session is
    /// registered.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown conversation or target user,
    /// `Unauthorized` when a group caller is not a conversation participant,
    /// `Store` when the call record cannot be created.
    pub async fn initiate(
        &self,
        caller_id: &str,
        request: InitiateRequest,
    ) -> Result<Call, CoreError> {
        let (callees, conversation_id) = self.resolve_callees(caller_id, &request).await?;

        let call_id = request
            .call_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        // Reserve each reachable callee atomically against the user index:
        // check-and-insert under the entry guard, no await in between.
        let mut legs: Vec<CallParticipant> = Vec::with_capacity(callees.len());
        let mut reserved: Vec<UserId> = Vec::new();
        for callee in callees {
            let status = {
                let mut engaged = self.by_user.entry(callee.clone()).or_default();
                if !engaged.is_empty() {
                    ParticipantStatus::Busy
                } else if self.presence.is_online(&callee) {
                    engaged.insert(call_id.clone());
                    reserved.push(callee.clone());
                    ParticipantStatus::Pending
                } else {
                    ParticipantStatus::Missed
                }
            };
            if status != ParticipantStatus::Pending {
                self.by_user.remove_if(&callee, |_, s| s.is_empty());
            }
            legs.push(CallParticipant::new(callee, status));
        }

        let mut call = Call::new(
            call_id.clone(),
            caller_id,
            legs,
            request.kind,
            request.is_group,
            conversation_id,
        );

        if reserved.is_empty() {
            // Nobody rings: terminal from the start.
            call.status = CallStatus::Missed;
            call.ended_at = Some(Utc::now());
        }

        if let Err(e) = self.store.create_call(&call).await {
            for user in &reserved {
                self.release(user, &call_id);
            }
            return Err(e.into());
        }

        if !reserved.is_empty() {
            let mut participant_ids: HashSet<UserId> = reserved.iter().cloned().collect();
            participant_ids.insert(caller_id.to_string());
            self.by_user
                .entry(caller_id.to_string())
                .or_default()
                .insert(call_id.clone());
            self.sessions.insert(
                call_id.clone(),
                Arc::new(Mutex::new(ActiveSession { participant_ids })),
            );
        }

        self.signal_invitations(caller_id, &call, &request.signal)
            .await;

        info!(
            call = %call.id,
            caller = %caller_id,
            status = ?call.status,
            ringing = reserved.len(),
            "Call initiated"
        );

        Ok(call)
    }

    /// Accept a ringing call.
    ///
    /// First accept wins the `ringing -> ongoing` transition; later accepts
    /// only update their own leg. The caller is notified with the answering
    /// signal.
    ///
    /// # Errors
    ///
    /// `NotFound` when no live session exists, `Forbidden` when the user is
    /// not among the call's participants.
    pub async fn accept(
        &self,
        call_id: &str,
        user_id: &str,
        signal: Value,
    ) -> Result<Call, CoreError> {
        let session = self.session(call_id)?;
        let guard = session.lock().await;

        // The session may have been torn down while we waited for the lock.
        if !self.sessions.contains_key(call_id) {
            return Err(CoreError::NotFound(call_id.to_string()));
        }

        let mut call = self.load_call(call_id).await?;
        let now = Utc::now();
        {
            let leg = call
                .participant_mut(user_id)
                .ok_or_else(|| CoreError::Forbidden(call_id.to_string()))?;
            leg.status = ParticipantStatus::Accepted;
            leg.joined_at = Some(now);
        }

        // First-accept-wins; re-running this when already ongoing is a no-op.
        if call.status == CallStatus::Ringing {
            call.status = CallStatus::Ongoing;
            call.started_at = Some(now);
        }

        self.store.put_call(&call).await?;
        drop(guard);

        self.notify(
            &call.caller_id,
            ServerEvent::CallAccepted {
                signal,
                from: user_id.to_string(),
                call_id: call_id.to_string(),
            },
        );

        debug!(call = %call_id, user = %user_id, "Call accepted");
        Ok(call)
    }

    /// Reject a ringing call.
    ///
    /// The call becomes `rejected` only when every leg has rejected; the
    /// caller is notified once per participant action.
    ///
    /// # Errors
    ///
    /// `NotFound` / `Forbidden` as for [`accept`](Self::accept).
    pub async fn reject(&self, call_id: &str, user_id: &str) -> Result<Call, CoreError> {
        let session = self.session(call_id)?;
        let mut guard = session.lock().await;

        if !self.sessions.contains_key(call_id) {
            return Err(CoreError::NotFound(call_id.to_string()));
        }

        let mut call = self.load_call(call_id).await?;
        {
            let leg = call
                .participant_mut(user_id)
                .ok_or_else(|| CoreError::Forbidden(call_id.to_string()))?;
            leg.status = ParticipantStatus::Rejected;
        }

        // A rejecting callee leaves the session and becomes callable again.
        guard.participant_ids.remove(user_id);
        self.release(user_id, call_id);

        let finished = call.all_rejected();
        if finished {
            call.status = CallStatus::Rejected;
            call.ended_at = Some(Utc::now());
        }

        self.store.put_call(&call).await?;

        if finished {
            // Remove before releasing the lock so a waiter re-checking the
            // session map cannot revive a terminal call.
            self.sessions.remove(call_id);
            let remaining: Vec<UserId> = guard.participant_ids.drain().collect();
            drop(guard);
            for user in remaining {
                self.release(&user, call_id);
            }
        } else {
            drop(guard);
        }

        self.notify(
            &call.caller_id,
            ServerEvent::CallRejected {
                from: user_id.to_string(),
                call_id: call_id.to_string(),
            },
        );

        debug!(call = %call_id, user = %user_id, finished, "Call rejected");
        Ok(call)
    }

    /// End a call.
    ///
    /// Every participant with a live connection (and the caller) is
    /// notified with the computed duration.
    ///
    /// # Errors
    ///
    /// `NotFound` / `Forbidden` as for [`accept`](Self::accept).
    pub async fn end(&self, call_id: &str, user_id: &str) -> Result<Call, CoreError> {
        let session = self.session(call_id)?;
        let guard = session.lock().await;

        if !self.sessions.contains_key(call_id) {
            return Err(CoreError::NotFound(call_id.to_string()));
        }

        let mut call = self.load_call(call_id).await?;
        if call.caller_id != user_id && call.participant(user_id).is_none() {
            return Err(CoreError::Forbidden(call_id.to_string()));
        }

        call.finish(CallStatus::Ended, Utc::now());
        self.store.put_call(&call).await?;

        // Remove before releasing the lock so a waiter re-checking the
        // session map cannot revive a terminal call.
        self.sessions.remove(call_id);
        let members: Vec<UserId> = guard.participant_ids.iter().cloned().collect();
        drop(guard);
        for member in &members {
            self.release(member, call_id);
        }

        let event = ServerEvent::CallEnded {
            from: user_id.to_string(),
            call_id: call_id.to_string(),
            reason: None,
            duration_secs: Some(call.duration_secs),
        };
        for member in members.iter().filter(|m| m.as_str() != user_id) {
            self.notify(member, event.clone());
        }

        info!(call = %call_id, ended_by = %user_id, duration = call.duration_secs, "Call ended");
        Ok(call)
    }

    /// Reconcile live sessions after a connection drop.
    ///
    /// Every other participant of each affected session is notified with
    /// reason `disconnect`, the session is removed, and the call record is
    /// persisted as `ended`. Store failures are logged; cleanup still runs
    /// to completion, the triggering connection is already gone.
    pub async fn handle_disconnect(&self, user_id: &str) {
        let Some((_, call_ids)) = self.by_user.remove(user_id) else {
            return;
        };

        for call_id in call_ids {
            let Some((_, session)) = self.sessions.remove(&call_id) else {
                continue;
            };
            let guard = session.lock().await;
            let others: Vec<UserId> = guard
                .participant_ids
                .iter()
                .filter(|p| p.as_str() != user_id)
                .cloned()
                .collect();
            drop(guard);

            for other in &others {
                self.release(other, &call_id);
            }

            let mut duration_secs = 0;
            match self.store.get_call(&call_id).await {
                Ok(Some(mut call)) if !call.status.is_terminal() => {
                    call.finish(CallStatus::Ended, Utc::now());
                    duration_secs = call.duration_secs;
                    if let Err(e) = self.store.put_call(&call).await {
                        warn!(call = %call_id, error = %e, "Disconnect cleanup persist failed");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(call = %call_id, error = %e, "Disconnect cleanup load failed");
                }
            }

            let event = ServerEvent::CallEnded {
                from: user_id.to_string(),
                call_id: call_id.clone(),
                reason: Some("disconnect".to_string()),
                duration_secs: Some(duration_secs),
            };
            for other in &others {
                self.notify(other, event.clone());
            }

            info!(call = %call_id, user = %user_id, "Call ended by disconnect");
        }
    }

    // ── Internals ──────────────────────────────────────────────────────

    async fn resolve_callees(
        &self,
        caller_id: &str,
        request: &InitiateRequest,
    ) -> Result<(Vec<UserId>, Option<ConversationId>), CoreError> {
        if request.is_group {
            let conversation_id = request
                .conversation_id
                .clone()
                .ok_or_else(|| CoreError::NotFound("conversation".to_string()))?;
            let conversation = self
                .store
                .get_conversation(&conversation_id)
                .await?
                .ok_or_else(|| CoreError::NotFound(conversation_id.clone()))?;
            if !conversation.is_participant(caller_id) {
                return Err(CoreError::Unauthorized(conversation_id));
            }
            Ok((conversation.recipients(caller_id), Some(conversation_id)))
        } else {
            let callee = request
                .user_to_call
                .clone()
                .ok_or_else(|| CoreError::NotFound("target user".to_string()))?;
            if self.store.get_user(&callee).await?.is_none() {
                return Err(CoreError::NotFound(callee));
            }
            let conversation = self.store.find_or_create_private(caller_id, &callee).await?;
            Ok((vec![callee], Some(conversation.id)))
        }
    }

    /// Deliver `incoming-call-signal` to ringing legs and busy/unreachable
    /// reports to the caller.
    async fn signal_invitations(&self, caller_id: &str, call: &Call, signal: &Value) {
        let caller = match self.store.get_user(caller_id).await {
            Ok(Some(profile)) => profile,
            Ok(None) | Err(_) => crate::types::UserProfile {
                id: caller_id.to_string(),
                name: caller_id.to_string(),
                avatar_url: None,
            },
        };

        for leg in &call.participants {
            match leg.status {
                ParticipantStatus::Pending => {
                    self.notify(
                        &leg.user_id,
                        ServerEvent::IncomingCallSignal {
                            signal: signal.clone(),
                            from: caller_id.to_string(),
                            caller_name: caller.name.clone(),
                            caller_avatar: caller.avatar_url.clone(),
                            call_type: call.kind,
                            call_id: call.id.clone(),
                            is_group: call.is_group,
                            room_id: call.room_id.clone(),
                        },
                    );
                }
                ParticipantStatus::Busy => {
                    self.notify(
                        caller_id,
                        ServerEvent::UserBusy {
                            from: leg.user_id.clone(),
                            call_id: call.id.clone(),
                        },
                    );
                }
                ParticipantStatus::Missed => {
                    self.notify(caller_id, ServerEvent::user_unavailable(leg.user_id.clone()));
                }
                ParticipantStatus::Accepted | ParticipantStatus::Rejected => {}
            }
        }
    }

    fn session(&self, call_id: &str) -> Result<Arc<Mutex<ActiveSession>>, CoreError> {
        self.sessions
            .get(call_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| CoreError::NotFound(call_id.to_string()))
    }

    async fn load_call(&self, call_id: &str) -> Result<Call, CoreError> {
        self.store
            .get_call(call_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(call_id.to_string()))
    }

    /// Drop a user's index entry for a call.
    fn release(&self, user_id: &str, call_id: &str) {
        if let Some(mut entry) = self.by_user.get_mut(user_id) {
            entry.remove(call_id);
        }
        self.by_user.remove_if(user_id, |_, s| s.is_empty());
    }

    fn notify(&self, user_id: &str, event: ServerEvent) {
        if !self.presence.send_to_user(user_id, Arc::new(event)) {
            trace!(user = %user_id, "Call notification dropped: no live connection");
        }
    }
}
