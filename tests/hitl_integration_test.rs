//! HITL 暂停 / 恢复集成测试

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use hive::agent::{ScriptStep, ScriptedAgent};
    use hive::domain::{ActorIdentity, ChatRequest, HitlType, Role};
    use hive::execution::{CoordinatorSettings, ExecutionCoordinator, ResumeRequest};
    use hive::hitl::{HitlStateStore, HitlStoreSettings, STATE_NOT_FOUND};
    use hive::storage::{MemoryStateCache, MemoryStreamStore, SnapshotStore, SqliteSnapshotStore, StreamStore};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn coordinator(
        streams: Arc<dyn StreamStore>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> ExecutionCoordinator {
        // 每个“进程”有自己的快速存储
        let cache = Arc::new(MemoryStateCache::new());
        let settings = HitlStoreSettings {
            retry_delay: Duration::from_millis(5),
            ..Default::default()
        };
        let hitl = Arc::new(HitlStateStore::new(cache.clone(), snapshots, settings));
        ExecutionCoordinator::new(streams, cache, hitl, CoordinatorSettings::default())
    }

    fn identity() -> ActorIdentity {
        ActorIdentity::with_default_mode("t1", "p1")
    }

    fn ask_decision() -> ScriptStep {
        ScriptStep::AskHuman {
            hitl_type: HitlType::Decision,
            request_data: json!({"question": "Which environment?", "options": ["staging", "deploy"]}),
            timeout_seconds: 60,
        }
    }

    #[tokio::test]
    async fn test_sequence_numbers_survive_restart() {
        let streams: Arc<dyn StreamStore> = Arc::new(MemoryStreamStore::new());
        let snapshots: Arc<dyn SnapshotStore> = Arc::new(SqliteSnapshotStore::in_memory().await.unwrap());

        let agent = Arc::new(ScriptedAgent::new(vec![
            vec![ScriptStep::Think("planning".into()), ask_decision()],
            vec![ScriptStep::Say("deployed".into())],
        ]));

        let before = coordinator(streams.clone(), snapshots.clone());
        let paused = before
            .run_chat(&identity(), agent.clone(), ChatRequest::new("c1", "u1", "ship it"), CancellationToken::new())
            .await;
        assert!(paused.hitl_pending);
        let request_id = paused.hitl_request_id.clone().unwrap();
        drop(before);

        // 新进程：快速存储为空，只能从快照恢复
        let after = coordinator(streams.clone(), snapshots);
        let resumed = after
            .resume(
                &identity(),
                agent.clone(),
                ResumeRequest::new(&request_id, json!({"decision": "deploy"})),
                CancellationToken::new(),
            )
            .await;
        assert!(!resumed.is_error, "{:?}", resumed.error_message);
        assert_eq!(resumed.content, "deployed");

        let events = after.event_log().events("c1").await.unwrap();
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence_number).collect();
        assert!(sequences.windows(2).all(|w| w[0] < w[1]), "not increasing: {:?}", sequences);
        assert!(events.iter().any(|e| e.event_type == "hitl_requested"));
        assert!(events.iter().any(|e| e.event_type == "hitl_resolved"));
        assert_eq!(resumed.sequence_number, *sequences.last().unwrap());

        let inputs = agent.inputs();
        let last = inputs[1].messages.last().unwrap();
        assert_eq!(last.role, Role::Tool);
        assert_eq!(last.content, "User chose: deploy");
    }

    #[tokio::test]
    async fn test_unknown_request_fails_fast() {
        let streams: Arc<dyn StreamStore> = Arc::new(MemoryStreamStore::new());
        let snapshots: Arc<dyn SnapshotStore> = Arc::new(SqliteSnapshotStore::in_memory().await.unwrap());
        let coord = coordinator(streams, snapshots);
        let agent = Arc::new(ScriptedAgent::new(vec![]));

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            coord.resume(
                &identity(),
                agent.clone(),
                ResumeRequest::new("hitl_missing", json!({"answer": "A"})).in_conversation("c9"),
                CancellationToken::new(),
            ),
        )
        .await
        .expect("resume of an unknown request must not hang");

        assert!(result.is_error);
        assert_eq!(result.error_message.as_deref(), Some(STATE_NOT_FOUND));
        assert_eq!(result.conversation_id, "c9");
        assert!(result.message_id.is_empty());
        assert!(agent.inputs().is_empty());
    }

    #[tokio::test]
    async fn test_second_resume_finds_no_state() {
        let streams: Arc<dyn StreamStore> = Arc::new(MemoryStreamStore::new());
        let snapshots: Arc<dyn SnapshotStore> = Arc::new(SqliteSnapshotStore::in_memory().await.unwrap());
        let coord = coordinator(streams, snapshots);
        let agent = Arc::new(ScriptedAgent::new(vec![vec![ask_decision()], vec![ScriptStep::Say("ok".into())]]));

        let paused = coord
            .run_chat(&identity(), agent.clone(), ChatRequest::new("c2", "u1", "go"), CancellationToken::new())
            .await;
        let request_id = paused.hitl_request_id.unwrap();

        let first = coord
            .resume(
                &identity(),
                agent.clone(),
                ResumeRequest::new(&request_id, json!({"decision": "staging"})),
                CancellationToken::new(),
            )
            .await;
        assert!(!first.is_error);
        let turns = agent.inputs().len();

        let second = coord
            .resume(
                &identity(),
                agent.clone(),
                ResumeRequest::new(&request_id, json!({"decision": "deploy"})),
                CancellationToken::new(),
            )
            .await;
        assert!(second.is_error);
        assert_eq!(second.error_message.as_deref(), Some(STATE_NOT_FOUND));
        assert_eq!(agent.inputs().len(), turns);
    }

    #[tokio::test]
    async fn test_clarification_option_becomes_tool_result() {
        let streams: Arc<dyn StreamStore> = Arc::new(MemoryStreamStore::new());
        let snapshots: Arc<dyn SnapshotStore> = Arc::new(SqliteSnapshotStore::in_memory().await.unwrap());
        let coord = coordinator(streams, snapshots);
        let agent = Arc::new(ScriptedAgent::new(vec![
            vec![ScriptStep::AskHuman {
                hitl_type: HitlType::Clarification,
                request_data: json!({"question": "Which one?", "options": ["A", "B"]}),
                timeout_seconds: 60,
            }],
            vec![],
        ]));

        let paused = coord
            .run_chat(&identity(), agent.clone(), ChatRequest::new("c3", "u1", "pick"), CancellationToken::new())
            .await;
        let request_id = paused.hitl_request_id.unwrap();

        let resumed = coord
            .resume(
                &identity(),
                agent.clone(),
                ResumeRequest::new(&request_id, json!({"answer": "A", "selected_options": ["A"]})),
                CancellationToken::new(),
            )
            .await;
        assert!(!resumed.is_error);

        let inputs = agent.inputs();
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[1].messages.last().unwrap().content, "User selected: A");
        // 空脚本回显最后一条输入
        assert_eq!(resumed.content, "Echo: User selected: A");
    }
    #[tokio::test]
    async fn test_nested_pause_replaces_state_and_keeps_sequence() {
        let streams: Arc<dyn StreamStore> = Arc::new(MemoryStreamStore::new());
        let snapshots: Arc<dyn SnapshotStore> = Arc::new(SqliteSnapshotStore::in_memory().await.unwrap());
        let agent = Arc::new(ScriptedAgent::new(vec![
            vec![ask_decision()],
            vec![ScriptStep::Think("need approval too".into()), ask_decision()],
            vec![ScriptStep::Say("shipped".into())],
        ]));
        let coord = coordinator(streams.clone(), snapshots.clone());

        let first = coord
            .run_chat(&identity(), agent.clone(), ChatRequest::new("c4", "u1", "ship it"), CancellationToken::new())
            .await;
        let first_request = first.hitl_request_id.clone().unwrap();

        let second = coord
            .resume(
                &identity(),
                agent.clone(),
                ResumeRequest::new(&first_request, json!({"decision": "staging"})),
                CancellationToken::new(),
            )
            .await;
        assert!(second.hitl_pending, "{:?}", second.error_message);
        assert!(!second.is_error);
        let second_request = second.hitl_request_id.clone().unwrap();
        assert_ne!(first_request, second_request);

        // 第一次暂停的状态已被认领删除，第二次的已双写
        assert!(coord.hitl_store().load(&first_request).await.is_none());
        assert!(snapshots.latest_by_request(&first_request).await.unwrap().is_none());
        let (pending, _) = coord.hitl_store().load(&second_request).await.unwrap();
        assert_eq!(pending.last_sequence_number, second.sequence_number);
        assert!(snapshots.latest_by_request(&second_request).await.unwrap().is_some());

        let done = coord
            .resume(
                &identity(),
                agent.clone(),
                ResumeRequest::new(&second_request, json!({"decision": "deploy"})),
                CancellationToken::new(),
            )
            .await;
        assert!(!done.is_error, "{:?}", done.error_message);
        assert_eq!(done.content, "shipped");
        assert!(first.sequence_number < second.sequence_number);
        assert!(second.sequence_number < done.sequence_number);

        let events = coord.event_log().events("c4").await.unwrap();
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence_number).collect();
        assert!(sequences.windows(2).all(|w| w[0] < w[1]), "not increasing: {:?}", sequences);
        assert_eq!(events.iter().filter(|e| e.event_type == "hitl_requested").count(), 2);
        assert_eq!(events.iter().filter(|e| e.event_type == "hitl_resolved").count(), 2);
        assert!(coord.hitl_store().load(&second_request).await.is_none());
    }
}
