//! 会话 Actor / 注册表 / HITL 路由集成测试

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use hive::actor::LocalActorRuntime;
    use hive::agent::{ScriptStep, ScriptedAgent, ScriptedAgentFactory};
    use hive::config::HiveConfig;
    use hive::domain::{ActorIdentity, AgentExecutionConfig, ChatRequest, ChatResult, HitlResponseMessage, HitlType};
    use hive::mcp::MockTransportFactory;
    use hive::router::response_channel_key;
    use hive::storage::{
        MemoryStateCache, MemoryStreamStore, SnapshotStore, SqliteSnapshotStore, SqliteStreamStore, StreamStore,
    };
    use hive::{ConsumerMode, Hive, HiveParts};
    use serde_json::json;
    use tokio::sync::broadcast;

    async fn hive_with(factory: Arc<ScriptedAgentFactory>) -> Hive {
        let snapshots = Arc::new(SqliteSnapshotStore::in_memory().await.unwrap());
        hive_over(factory, Arc::new(MemoryStreamStore::new()), snapshots)
    }

    /// 共享持久化存储、其余部件全新的 Hive（模拟进程重启）
    fn hive_over(
        factory: Arc<ScriptedAgentFactory>,
        streams: Arc<dyn StreamStore>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Hive {
        Hive::new(
            HiveConfig::default(),
            HiveParts {
                streams,
                cache: Arc::new(MemoryStateCache::new()),
                snapshots,
                runtime: Arc::new(LocalActorRuntime::new()),
                agents: factory,
                transports: Arc::new(MockTransportFactory::new()),
            },
        )
    }

    fn ask_clarification() -> ScriptStep {
        ScriptStep::AskHuman {
            hitl_type: HitlType::Clarification,
            request_data: json!({"question": "Which one?", "options": ["A", "B"]}),
            timeout_seconds: 60,
        }
    }

    fn response(identity: &ActorIdentity, request_id: &str, conversation_id: &str) -> HitlResponseMessage {
        HitlResponseMessage {
            request_id: request_id.to_string(),
            response_data: json!({"answer": "A"}),
            tenant_id: identity.tenant_id.clone(),
            project_id: identity.project_id.clone(),
            conversation_id: conversation_id.to_string(),
            agent_mode: identity.agent_mode.clone(),
        }
    }

    async fn next_result(rx: &mut broadcast::Receiver<ChatResult>) -> ChatResult {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no result within 5s")
            .expect("result channel closed")
    }

    async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        check()
    }

    /// 发起一轮对话并等待其暂停，返回 HITL 请求 ID
    async fn pause_conversation(hive: &Hive, identity: &ActorIdentity, conversation_id: &str) -> String {
        let session = hive.session(identity, &AgentExecutionConfig::default()).await.unwrap();
        let mut results = session.subscribe_results();
        session
            .chat(ChatRequest::new(conversation_id, "u1", "choose for me"))
            .await
            .unwrap();
        let paused = next_result(&mut results).await;
        assert!(paused.hitl_pending);
        paused.hitl_request_id.unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_yields_one_actor() {
        let factory = Arc::new(ScriptedAgentFactory::new(Arc::new(ScriptedAgent::new(vec![]))));
        let hive = Arc::new(hive_with(factory.clone()).await);
        let identity = ActorIdentity::with_default_mode("t1", "p1");

        let mut joins = Vec::new();
        for _ in 0..8 {
            let hive = hive.clone();
            let identity = identity.clone();
            joins.push(tokio::spawn(async move {
                hive.registry()
                    .get_or_create(&identity, &AgentExecutionConfig::default())
                    .await
            }));
        }
        for join in joins {
            assert!(join.await.unwrap().is_ok());
        }

        let names = hive.registry().list().await.unwrap();
        assert_eq!(names, vec![identity.actor_name()]);
        assert_eq!(factory.created(), 1);
        hive.shutdown().await;
    }

    #[tokio::test]
    async fn test_router_resumes_through_registry() {
        let agent = Arc::new(ScriptedAgent::new(vec![vec![ask_clarification()], vec![]]));
        let factory = Arc::new(ScriptedAgentFactory::new(agent.clone()));
        let hive = hive_with(factory).await;
        assert_eq!(hive.start().await.unwrap(), ConsumerMode::Router);

        let identity = ActorIdentity::with_default_mode("t1", "p1");
        let request_id = pause_conversation(&hive, &identity, "c1").await;
        let session = hive.registry().get_if_exists(&identity).await.unwrap();
        let mut results = session.subscribe_results();

        hive.submit_hitl_response(&response(&identity, &request_id, "c1")).await.unwrap();
        let resumed = next_result(&mut results).await;
        assert!(!resumed.is_error, "{:?}", resumed.error_message);
        assert_eq!(resumed.content, "Echo: User selected: A");
        assert_eq!(agent.inputs().len(), 2);
        hive.shutdown().await;
    }

    #[tokio::test]
    async fn test_router_creates_missing_session() {
        let agent = Arc::new(ScriptedAgent::new(vec![vec![ask_clarification()], vec![]]));
        let factory = Arc::new(ScriptedAgentFactory::new(agent.clone()));
        let hive = hive_with(factory.clone()).await;
        hive.start().await.unwrap();

        let identity = ActorIdentity::with_default_mode("t1", "p2");
        let request_id = pause_conversation(&hive, &identity, "c2").await;

        // 暂停后会话消失（例如进程重启）
        assert!(hive.registry().kill(&identity.actor_name()).await.unwrap());
        assert!(hive.registry().get_if_exists(&identity).await.is_none());

        hive.submit_hitl_response(&response(&identity, &request_id, "c2")).await.unwrap();
        assert!(wait_for(|| agent.inputs().len() == 2).await);

        let session = hive.registry().get_if_exists(&identity).await.unwrap();
        let status = session.status().await.unwrap();
        assert!(status.is_initialized);
        assert_eq!(factory.created(), 2);
        hive.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_delivery_runs_one_turn() {
        let agent = Arc::new(ScriptedAgent::new(vec![
            vec![ask_clarification()],
            vec![ScriptStep::Sleep(Duration::from_millis(200)), ScriptStep::Say("picked A".into())],
        ]));
        let factory = Arc::new(ScriptedAgentFactory::new(agent.clone()));
        let hive = hive_with(factory).await;
        hive.start().await.unwrap();

        let identity = ActorIdentity::with_default_mode("t1", "p3");
        let request_id = pause_conversation(&hive, &identity, "c3").await;
        let session = hive.registry().get_if_exists(&identity).await.unwrap();
        let mut results = session.subscribe_results();

        let msg = response(&identity, &request_id, "c3");
        hive.submit_hitl_response(&msg).await.unwrap();
        hive.submit_hitl_response(&msg).await.unwrap();

        let resumed = next_result(&mut results).await;
        assert_eq!(resumed.content, "picked A");

        // 两条消息都被确认；重复的那条要么被忽略，要么找不到已认领的状态
        let mut acked = 0;
        for _ in 0..100 {
            acked = hive.consumer_status().await.unwrap().stats.acked;
            if acked >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(acked, 2);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(agent.inputs().len(), 2);
        hive.shutdown().await;
    }
    #[tokio::test]
    async fn test_restarted_hive_listens_for_pending_projects() {
        let agent = Arc::new(ScriptedAgent::new(vec![vec![ask_clarification()], vec![]]));
        let factory = Arc::new(ScriptedAgentFactory::new(agent.clone()));
        let streams: Arc<dyn StreamStore> = Arc::new(SqliteStreamStore::in_memory().await.unwrap());
        let snapshots: Arc<dyn SnapshotStore> = Arc::new(SqliteSnapshotStore::in_memory().await.unwrap());
        let identity = ActorIdentity::with_default_mode("t1", "p4");

        let first = hive_over(factory.clone(), streams.clone(), snapshots.clone());
        let request_id = pause_conversation(&first, &identity, "c4").await;
        first.shutdown().await;

        // 新进程只剩持久化的快照与通道
        let second = hive_over(factory.clone(), streams.clone(), snapshots.clone());
        assert_eq!(second.start().await.unwrap(), ConsumerMode::Router);
        let channels = second.consumer_status().await.unwrap().channels;
        assert_eq!(channels, vec![response_channel_key("t1", "p4")]);

        // 响应由外部直接写入通道
        let payload = serde_json::to_value(response(&identity, &request_id, "c4")).unwrap();
        streams
            .append(&response_channel_key("t1", "p4"), payload)
            .await
            .unwrap();
        assert!(wait_for(|| agent.inputs().len() == 2).await);
        assert!(wait_for(|| factory.created() == 2).await);
        second.shutdown().await;
    }
}
