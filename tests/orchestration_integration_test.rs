//! 编排集成测试

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use hive::agent::{AgentSpec, AgentState, KeywordStrategy};
    use hive::config::AppConfig;
    use hive::core::{Brief, ErrorKind, Orchestrator, OrchestratorBuilder, PhaseStatus, TaskStatus};
    use hive::memory::{persist_episodic, restore_episodic, EpisodicLog, FileStore};
    use hive::observability::{EventKind, MemorySink};
    use hive::tools::{ScriptStep, ScriptedTool};

    fn builder(config: AppConfig, editor_focus: &[&str]) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
            .tool(ScriptedTool::new("draft").otherwise(ScriptStep::Echo {
                prefix: "Draft: ".to_string(),
            }))
            .tool(ScriptedTool::new("review").otherwise(ScriptStep::Echo {
                prefix: "Review: ".to_string(),
            }))
            .role(KeywordStrategy::new("writer", "draft"))
            .role(KeywordStrategy::new("editor", "review").with_focus(editor_focus.iter().copied()))
            .agent(AgentSpec::new("writer-1", "writer", ["draft"]))
            .agent(AgentSpec::new("editor-1", "editor", ["review"]))
    }

    fn brief() -> Brief {
        Brief::new("Release notes", "blog")
            .requirement("summarize the release for customers")
            .keyword("release")
    }

    #[tokio::test]
    async fn test_standard_plan_runs_to_completion() {
        let sink = MemorySink::new();
        let orch = builder(AppConfig::default(), &[]).sink(sink.clone()).build().unwrap();
        let id = orch.submit_task(brief()).unwrap();
        assert_eq!(orch.get_task_status(&id).unwrap(), TaskStatus::Pending);

        let task = orch.execute_task(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Complete);
        assert!(task.plan.is_some());
        let phases: Vec<&str> = task.phase_results.iter().map(|p| p.phase_id.as_str()).collect();
        assert_eq!(phases, vec!["draft", "review"]);

        let review = &task.phase_results[1];
        let branches: Vec<&str> = review.branches.iter().map(|b| b.agent_id.as_str()).collect();
        assert_eq!(branches, vec!["editor-1", "writer-1"]);
        assert!(review.negotiation.as_ref().unwrap().consensus);
        assert!(task.output.as_deref().unwrap().contains("release"));

        assert_eq!(sink.count(EventKind::PhaseStarted), sink.count(EventKind::PhaseCompleted));
        assert!(sink.count(EventKind::NegotiationRound) >= 1);
        assert!(sink.count(EventKind::TaskStatusChanged) >= 4);

        for agent in orch.agents().all() {
            assert_eq!(agent.state(), AgentState::Idle);
            assert!(agent.stats().runs >= 1);
        }
        assert_eq!(orch.agents().episodic().len(), 2);
        assert!(orch.active_tasks().is_empty());
        assert_eq!(orch.get_task(&id).unwrap().status, TaskStatus::Complete);
    }

    #[tokio::test]
    async fn test_editor_concerns_are_mediated_into_final_draft() {
        let orch = builder(AppConfig::default(), &["zebra"]).build().unwrap();
        let id = orch.submit_task(brief()).unwrap();
        let task = orch.execute_task(&id).await.unwrap();

        let session = task.phase_results[1].negotiation.as_ref().unwrap();
        assert!(session.round_count() >= 2);
        assert!(session.round_count() <= 3);
        assert!(session.consensus);
        assert!(session.final_proposal.as_ref().unwrap().content.contains("zebra"));
    }

    #[tokio::test]
    async fn test_unavailable_tool_degrades_and_is_reported() {
        let orch = OrchestratorBuilder::new(AppConfig::default())
            .tool(
                ScriptedTool::new("draft")
                    .otherwise(ScriptStep::Fail(hive::HiveError::ToolUnavailable("draft".into()))),
            )
            .role(KeywordStrategy::new("writer", "draft"))
            .role(KeywordStrategy::new("editor", "draft"))
            .agent(AgentSpec::new("writer-1", "writer", ["draft"]))
            .agent(AgentSpec::new("editor-1", "editor", ["draft"]))
            .build()
            .unwrap();
        let id = orch.submit_task(brief()).unwrap();
        let task = orch.execute_task(&id).await.unwrap();

        assert_eq!(task.status, TaskStatus::Complete);
        assert!(task.is_incomplete());
        let draft = &task.phase_results[0];
        assert_eq!(draft.status, PhaseStatus::Partial);
        assert!(draft.branches[0].degraded);
        assert!(task
            .deficiencies()
            .iter()
            .any(|d| d.kind == ErrorKind::ToolUnavailable));
    }

    async fn run_once(orch: &Orchestrator) {
        let id = orch.submit_task(brief()).unwrap();
        orch.execute_task(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_survives_restart_through_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        let episodic = Arc::new(EpisodicLog::new(64));
        let orch = builder(AppConfig::default(), &[])
            .episodic(Arc::clone(&episodic))
            .build()
            .unwrap();
        run_once(&orch).await;
        for agent in orch.agents().all() {
            agent.memory().lock().await.persist(&store).await.unwrap();
        }
        persist_episodic(&episodic, &store).await.unwrap();
        let remembered = orch
            .agents()
            .get("writer-1")
            .unwrap()
            .memory()
            .lock()
            .await
            .short_term()
            .len();
        assert!(remembered > 0);

        let restored_log = Arc::new(EpisodicLog::new(64));
        assert!(restore_episodic(&restored_log, &store).await.unwrap());
        assert_eq!(restored_log.len(), episodic.len());

        let restarted = builder(AppConfig::default(), &[])
            .episodic(Arc::clone(&restored_log))
            .build()
            .unwrap();
        let writer = restarted.agents().get("writer-1").unwrap();
        let mut memory = writer.memory().lock().await;
        assert!(memory.restore(&store).await.unwrap());
        assert_eq!(memory.short_term().len(), remembered);
    }
}
