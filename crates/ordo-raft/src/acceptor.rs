//! Follower side of log replication.
//!
//! An AppendEntries request is accepted only if the follower holds the
//! leader's `prev_log` position. Entries already present with the same term
//! are skipped, so a delayed or duplicated request never truncates anything.
//! At the first entry whose term differs, the follower's suffix from that
//! index is dropped and the rest of the batch appended. The commit index then
//! moves to `min(leader_commit, last index covered by this request)`.

use crate::error::Result;
use crate::state::RaftState;
use crate::types::*;

impl RaftState {
    /// Handle AppendEntries RPC (replication and heartbeat).
    pub async fn handle_append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let mut guard = self.lock().await;
        let core = &mut *guard;

        if request.term < core.term {
            return Ok(AppendEntriesResponse {
                term: core.term,
                success: false,
                match_index: LogIndex::ZERO,
                conflict: None,
            });
        }

        if request.term > core.term || core.role != Role::Follower {
            if core.role == Role::Leader {
                tracing::warn!(
                    term = %core.term,
                    leader = %request.leader_id,
                    "Leader received AppendEntries for its term or newer"
                );
            }
            self.step_down(core, request.term, Some(request.leader_id))
                .await?;
        } else if core.leader_id != Some(request.leader_id) {
            core.leader_id = Some(request.leader_id);
            self.publish_status(core);
        }

        let prev = request.prev_log;
        let snapshot_point = core.log.snapshot_point();

        // Anything below the snapshot point is committed, hence identical
        let prev_ok = prev.index < snapshot_point.index || core.log.matches(prev);
        if !prev_ok {
            let hint = core.log.conflict_hint(prev);
            tracing::debug!(
                prev = %prev,
                hint_term = ?hint.term,
                hint_index = %hint.index,
                "Rejecting AppendEntries: missing prev entry"
            );
            return Ok(AppendEntriesResponse {
                term: core.term,
                success: false,
                match_index: LogIndex::ZERO,
                conflict: Some(hint),
            });
        }

        let last_new = request
            .entries
            .last()
            .map(|e| e.index)
            .unwrap_or(prev.index);

        let mut remaining = request.entries.into_iter();
        let mut to_append = Vec::new();
        for entry in remaining.by_ref() {
            if entry.index <= snapshot_point.index {
                continue;
            }
            match core.log.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(term) => {
                    tracing::info!(
                        index = %entry.index,
                        ours = %term,
                        leader = %entry.term,
                        "Truncating conflicting suffix"
                    );
                    core.log.truncate_suffix(entry.index).await?;
                    to_append.push(entry);
                    break;
                }
                None => {
                    to_append.push(entry);
                    break;
                }
            }
        }
        to_append.extend(remaining);

        if !to_append.is_empty() {
            let tail = core.log.last_term_index();
            core.log.append(tail, to_append).await?;
        }

        let commit = request.leader_commit.min(last_new);
        if commit > core.log.commit_index() {
            core.log.set_commit_index(commit)?;
            self.persist_hard_state(core).await?;
            self.publish_commit(commit);
        }

        Ok(AppendEntriesResponse {
            term: core.term,
            success: true,
            match_index: last_new,
            conflict: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::id::{ClientId, PeerId};
    use crate::state::test_support::test_state;
    use crate::state::RaftState;
    use crate::types::*;
    use bytes::Bytes;

    fn entry(term: u64, index: u64, body: &str) -> LogEntry {
        LogEntry::command(
            Term(term),
            LogIndex(index),
            Bytes::from(body.to_string()),
            ClientId::NIL,
            index,
        )
    }

    fn ti(term: u64, index: u64) -> TermIndex {
        TermIndex::new(Term(term), LogIndex(index))
    }

    fn append(
        term: u64,
        leader: PeerId,
        prev: TermIndex,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> AppendEntriesRequest {
        AppendEntriesRequest {
            term: Term(term),
            leader_id: leader,
            prev_log: prev,
            entries,
            leader_commit: LogIndex(leader_commit),
        }
    }

    async fn terms(state: &RaftState) -> Vec<u64> {
        state
            .lock()
            .await
            .log
            .entries()
            .map(|e| e.term.as_u64())
            .collect()
    }

    async fn setup() -> (RaftState, Vec<PeerId>) {
        let ids: Vec<PeerId> = (0..3).map(|_| PeerId::random()).collect();
        let state = test_state(ids[0], &ids).await;
        (state, ids)
    }

    #[tokio::test]
    async fn test_heartbeat_adopts_leader_and_term() {
        let (state, ids) = setup().await;

        let response = state
            .handle_append_entries(append(3, ids[1], TermIndex::ZERO, vec![], 0))
            .await
            .unwrap();

        assert!(response.success);
        assert_eq!(response.term, Term(3));
        assert_eq!(state.current_term(), Term(3));
        assert_eq!(state.leader(), Some(ids[1]));
    }

    #[tokio::test]
    async fn test_rejects_stale_term() {
        let (state, ids) = setup().await;
        state
            .handle_append_entries(append(5, ids[1], TermIndex::ZERO, vec![], 0))
            .await
            .unwrap();

        let response = state
            .handle_append_entries(append(
                4,
                ids[2],
                TermIndex::ZERO,
                vec![entry(4, 1, "x")],
                0,
            ))
            .await
            .unwrap();
        assert!(!response.success);
        assert_eq!(response.term, Term(5));
        assert!(terms(&state).await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_prev_returns_hint() {
        let (state, ids) = setup().await;
        state
            .handle_append_entries(append(
                1,
                ids[1],
                TermIndex::ZERO,
                vec![entry(1, 1, "a"), entry(1, 2, "b")],
                0,
            ))
            .await
            .unwrap();

        // Follower's tail is 2, leader probes at 5
        let response = state
            .handle_append_entries(append(1, ids[1], ti(1, 5), vec![entry(1, 6, "f")], 0))
            .await
            .unwrap();
        assert!(!response.success);
        let hint = response.conflict.unwrap();
        assert_eq!(hint.term, None);
        assert_eq!(hint.index, LogIndex(3));

        // Wrong term at an existing index
        let response = state
            .handle_append_entries(append(2, ids[1], ti(2, 2), vec![], 0))
            .await
            .unwrap();
        let hint = response.conflict.unwrap();
        assert_eq!(hint.term, Some(Term(1)));
        assert_eq!(hint.index, LogIndex(1));
    }

    #[tokio::test]
    async fn test_divergent_suffix_replaced() {
        let (state, ids) = setup().await;
        // Old leader in term 2 left two uncommitted entries
        state
            .handle_append_entries(append(
                2,
                ids[1],
                TermIndex::ZERO,
                vec![entry(1, 1, "a"), entry(2, 2, "X"), entry(2, 3, "Y")],
                1,
            ))
            .await
            .unwrap();
        assert_eq!(terms(&state).await, vec![1, 2, 2]);

        // New leader in term 3 overwrites from index 2
        let response = state
            .handle_append_entries(append(
                3,
                ids[2],
                ti(1, 1),
                vec![entry(3, 2, "P"), entry(3, 3, "Q")],
                1,
            ))
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(response.match_index, LogIndex(3));
        assert_eq!(terms(&state).await, vec![1, 3, 3]);

        let core = state.lock().await;
        assert_eq!(
            core.log.get(LogIndex(2)).unwrap().payload,
            EntryPayload::Command(Bytes::from("P"))
        );
    }

    #[tokio::test]
    async fn test_duplicate_request_does_not_truncate() {
        let (state, ids) = setup().await;
        let first = append(1, ids[1], TermIndex::ZERO, vec![entry(1, 1, "a")], 0);
        state.handle_append_entries(first.clone()).await.unwrap();
        state
            .handle_append_entries(append(
                1,
                ids[1],
                ti(1, 1),
                vec![entry(1, 2, "b"), entry(1, 3, "c")],
                0,
            ))
            .await
            .unwrap();

        // Delayed copy of the first request arrives again
        let response = state.handle_append_entries(first).await.unwrap();
        assert!(response.success);
        assert_eq!(response.match_index, LogIndex(1));
        assert_eq!(terms(&state).await, vec![1, 1, 1]);
    }

    #[tokio::test]
    async fn test_commit_bounded_by_request() {
        let (state, ids) = setup().await;
        state
            .handle_append_entries(append(
                1,
                ids[1],
                TermIndex::ZERO,
                vec![entry(1, 1, "a"), entry(1, 2, "b"), entry(1, 3, "c")],
                0,
            ))
            .await
            .unwrap();

        // Heartbeat only vouches for index 1
        state
            .handle_append_entries(append(1, ids[1], ti(1, 1), vec![], 3))
            .await
            .unwrap();
        assert_eq!(state.commit_index(), LogIndex(1));

        state
            .handle_append_entries(append(1, ids[1], ti(1, 3), vec![], 2))
            .await
            .unwrap();
        assert_eq!(state.commit_index(), LogIndex(2));

        // Commit never decreases
        state
            .handle_append_entries(append(1, ids[1], ti(1, 3), vec![], 1))
            .await
            .unwrap();
        assert_eq!(state.commit_index(), LogIndex(2));
    }

    #[tokio::test]
    async fn test_candidate_steps_down_on_same_term_append() {
        let (state, ids) = setup().await;
        let ballot = state.start_election().await.unwrap().unwrap();
        assert_eq!(state.role(), Role::Candidate);

        let response = state
            .handle_append_entries(append(
                ballot.term.as_u64(),
                ids[1],
                TermIndex::ZERO,
                vec![],
                0,
            ))
            .await
            .unwrap();
        assert!(response.success);
        assert_eq!(state.role(), Role::Follower);
        assert_eq!(state.leader(), Some(ids[1]));
        // Vote for self in that term is kept
        assert_eq!(state.lock().await.voted_for, Some(ids[0]));
    }
}
