//! End-to-end orchestrator scenarios against the scripted mock client:
//! multi-turn session resume behavior, spawn directives and their depth
//! limit, the write-permission gate, streaming event order, and the
//! trigger-to-completion document lifecycle.

use std::sync::Arc;
use std::time::Duration;

use quill_core::agents::AgentLoader;
use quill_core::events::EventBus;
use quill_core::llm::mock::{MockLlm, MockTurn};
use quill_core::llm::{LlmClient, ToolUse};
use quill_core::orchestrator::{ExecuteRequest, Orchestrator, OrchestratorConfig};
use quill_core::permissions::{PermissionBroker, PermissionEvent};
use quill_core::queue::ExecutionQueue;
use quill_core::scanner::{AgentStatus, DocumentScanner};
use quill_core::sessions::context::ResumeMethod;
use quill_core::sessions::record::SessionScope;
use quill_core::sessions::SessionStore;
use quill_core::vault::Vault;
use quill_core::OrchestratorServices;

const HELPER_AGENT: &str = "---\nname: helper\ntype: chatbot\npermissions:\n  write: [\"notes/*\"]\n  spawn: [\"agents/*\"]\n---\nYou are a helpful test agent.\n";

const CHILD_AGENT: &str = "---\nname: child\ntype: standalone\npermissions:\n  spawn: [\"agents/*\"]\n---\nYou are a spawned child agent.\n";

const REFLECT_AGENT: &str =
    "---\nname: reflect\ntype: document-bound\n---\nYou reflect on documents.\n";

struct Harness {
    _dir: tempfile::TempDir,
    vault: Arc<Vault>,
    llm: Arc<MockLlm>,
    orchestrator: Arc<Orchestrator>,
    services: OrchestratorServices,
}

async fn harness(turns: Vec<MockTurn>, max_spawn_depth: u32) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let vault = Arc::new(Vault::open(dir.path()).unwrap());
    vault.write("agents/helper.md", HELPER_AGENT).await.unwrap();
    vault.write("agents/child.md", CHILD_AGENT).await.unwrap();
    vault.write("agents/reflect.md", REFLECT_AGENT).await.unwrap();

    let llm = Arc::new(MockLlm::with_turns(turns));
    let services = OrchestratorServices {
        agents: Arc::new(AgentLoader::new(Arc::clone(&vault))),
        queue: Arc::new(ExecutionQueue::new(
            max_spawn_depth,
            Some(vault.root().join(".queue/queue.json")),
        )),
        // No title synthesis in tests: scripted turns must stay in order.
        sessions: Arc::new(SessionStore::new(vault.root(), None)),
        scanner: Arc::new(DocumentScanner::new(Arc::clone(&vault))),
        broker: Arc::new(PermissionBroker::new(Duration::from_secs(2))),
        events: Arc::new(EventBus::new()),
        vault: Arc::clone(&vault),
        llm: Some(Arc::clone(&llm) as Arc<dyn LlmClient>),
    };
    let orchestrator = Arc::new(Orchestrator::new(
        services.clone(),
        OrchestratorConfig {
            max_concurrent: 1,
            max_spawn_depth,
            ..Default::default()
        },
    ));

    Harness {
        _dir: dir,
        vault,
        llm,
        orchestrator,
        services,
    }
}

fn chat_request(message: &str, session_id: &str) -> ExecuteRequest {
    ExecuteRequest {
        agent_path: "agents/helper.md".to_string(),
        message: message.to_string(),
        scope: SessionScope {
            session_id: Some(session_id.to_string()),
            document_path: None,
        },
        initial_context: None,
        depth: 0,
    }
}

/// Three chat turns: fresh, upstream resume, then context injection after
/// the upstream session disappears.
#[tokio::test]
async fn chat_session_resume_lifecycle() {
    let h = harness(
        vec![
            MockTurn::text("Hi!").with_session("up-1"),
            MockTurn::text("Noted: 42.").with_session("up-1"),
            MockTurn::text("It was 42.").with_session("up-2"),
        ],
        3,
    )
    .await;

    // Turn 1: brand new session.
    let outcome = h
        .orchestrator
        .execute(chat_request("Hello", "s1"))
        .await
        .unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.response, "Hi!");
    assert_eq!(outcome.message_count, 2);
    let resume = outcome.session_resume.unwrap();
    assert_eq!(resume.method, ResumeMethod::New);

    // Turn 2: the persisted handle resumes upstream.
    let outcome = h
        .orchestrator
        .execute(chat_request("Remember 42", "s1"))
        .await
        .unwrap();
    let resume = outcome.session_resume.unwrap();
    assert_eq!(resume.method, ResumeMethod::SdkResume);
    assert_eq!(resume.previous_message_count, 2);
    assert_eq!(outcome.message_count, 4);

    let queries = h.llm.recorded_queries();
    assert_eq!(queries[1].resume.as_deref(), Some("up-1"));
    assert_eq!(queries[1].prompt, "Remember 42");

    // Turn 3: upstream rejects the resume; the same call falls back to
    // context injection over the four stored messages.
    h.llm.set_reject_resume(true);
    let outcome = h
        .orchestrator
        .execute(chat_request("What was it?", "s1"))
        .await
        .unwrap();
    assert!(outcome.success);
    let resume = outcome.session_resume.unwrap();
    assert_eq!(resume.method, ResumeMethod::ContextInjection);
    assert_eq!(resume.messages_injected, 4);

    let queries = h.llm.recorded_queries();
    let last = queries.last().unwrap();
    assert_eq!(last.resume, None);
    assert!(last.prompt.starts_with("## Previous Conversation"));
    assert!(last.prompt.contains("Remember 42"));
}

/// Streaming runs emit `session` first, then init/text, then `done`, and
/// the concatenated deltas reproduce the final text.
#[tokio::test]
async fn streaming_event_order_and_deltas() {
    let h = harness(vec![MockTurn::text("streamed reply text")], 3).await;

    let mut rx = h
        .orchestrator
        .execute_streaming(chat_request("go", "s1"))
        .await
        .unwrap();

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    let kinds: Vec<String> = events
        .iter()
        .map(|e| {
            serde_json::to_value(e).unwrap()["type"]
                .as_str()
                .unwrap()
                .to_string()
        })
        .collect();
    assert_eq!(kinds.first().map(String::as_str), Some("session"));
    assert!(kinds.contains(&"init".to_string()));
    assert_eq!(kinds.last().map(String::as_str), Some("done"));

    let mut concatenated = String::new();
    for event in &events {
        let value = serde_json::to_value(event).unwrap();
        if value["type"] == "text" {
            concatenated.push_str(value["delta"].as_str().unwrap());
        }
    }
    assert_eq!(concatenated, "streamed reply text");

    let done = serde_json::to_value(events.last().unwrap()).unwrap();
    assert_eq!(done["response"], "streamed reply text");
}

/// A permitted spawn directive enqueues the child at depth + 1; once the
/// configured maximum is reached the directive is dropped without error.
#[tokio::test]
async fn spawn_directives_respect_depth_limit() {
    let spawn_text =
        "Done.\n\n```spawn\n{\"agent\": \"agents/child.md\", \"message\": \"continue\"}\n```\n";
    let h = harness(
        vec![MockTurn::text(spawn_text), MockTurn::text(spawn_text)],
        2,
    )
    .await;

    // Depth 0 run spawns the child at depth 1.
    let outcome = h
        .orchestrator
        .execute(chat_request("start", "s1"))
        .await
        .unwrap();
    assert_eq!(outcome.spawned.len(), 1);
    assert_eq!(outcome.spawned[0].agent_path, "agents/child.md");

    let state = h.services.queue.get_state().await;
    assert_eq!(state.pending.len(), 1);
    assert_eq!(state.pending[0].depth, 1);
    assert_eq!(
        state.pending[0].spawned_by.as_deref(),
        Some("agents/helper.md")
    );

    // A run already at depth 1 would spawn at depth 2 == max: dropped,
    // no error surfaced.
    let mut deep = chat_request("deeper", "s2");
    deep.depth = 1;
    let outcome = h.orchestrator.execute(deep).await.unwrap();
    assert!(outcome.success);
    assert!(outcome.spawned.is_empty());
    assert_eq!(h.services.queue.get_state().await.pending.len(), 1);
}

/// Spawns outside the caller's `spawn` globs are denied and skipped.
#[tokio::test]
async fn spawn_outside_policy_is_denied() {
    let narrow_agent = "---\nname: narrow\ntype: chatbot\npermissions:\n  spawn: [\"agents/child.md\"]\n---\nPrompt.\n";
    let spawn_text =
        "```spawn\n{\"agent\": \"agents/helper.md\", \"message\": \"not allowed\"}\n```";

    let h = harness(vec![MockTurn::text(spawn_text)], 3).await;
    h.vault
        .write("agents/narrow.md", narrow_agent)
        .await
        .unwrap();

    let mut req = chat_request("go", "s1");
    req.agent_path = "agents/narrow.md".to_string();
    let outcome = h.orchestrator.execute(req).await.unwrap();
    assert!(outcome.success);
    assert!(outcome.spawned.is_empty());
    assert!(!h.services.queue.has_pending().await);
}

/// An out-of-policy write surfaces a permission request; denying it
/// resolves the tool callback and lands in `permissionDenials`.
#[tokio::test]
async fn write_permission_gate_deny_flow() {
    let turn = MockTurn::text("attempted a write").with_tool_use(ToolUse {
        id: "tu-1".to_string(),
        name: "write".to_string(),
        input: serde_json::json!({"file_path": "projects/secret.txt", "content": "x"}),
    });
    let h = harness(vec![turn], 3).await;

    let mut events = h.services.broker.subscribe();
    let orchestrator = Arc::clone(&h.orchestrator);
    let exec = tokio::spawn(async move {
        orchestrator
            .execute(chat_request("write it", "s1"))
            .await
            .unwrap()
    });

    // The request id composes the session id with the tool-use id.
    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    let request = match event {
        PermissionEvent::Request { request } => request,
        other => panic!("expected permissionRequest, got {:?}", other),
    };
    assert!(request.id.ends_with("-tu-1"));
    assert_eq!(request.subject.as_deref(), Some("projects/secret.txt"));
    assert_eq!(request.allowed_patterns, vec!["notes/*".to_string()]);

    assert!(h.services.broker.deny(&request.id).await);

    let outcome = exec.await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.permission_denials.len(), 1);
    assert_eq!(outcome.permission_denials[0].reason, "denied");
    assert_eq!(
        outcome.permission_denials[0].subject.as_deref(),
        Some("projects/secret.txt")
    );
    assert!(h.services.broker.list_pending().await.is_empty());
    // The denied file was never created.
    assert!(!h.vault.exists("projects/secret.txt").await);
}

/// Unanswered requests time out into a denial with reason "timeout".
#[tokio::test]
async fn write_permission_gate_timeout_flow() {
    let turn = MockTurn::text("attempted a write").with_tool_use(ToolUse {
        id: "tu-9".to_string(),
        name: "write".to_string(),
        input: serde_json::json!({"file_path": "projects/secret.txt"}),
    });
    // Harness broker timeout is two seconds.
    let h = harness(vec![turn], 3).await;

    let outcome = h
        .orchestrator
        .execute(chat_request("write it", "s1"))
        .await
        .unwrap();
    assert_eq!(outcome.permission_denials.len(), 1);
    assert_eq!(outcome.permission_denials[0].reason, "timeout");
    assert!(h.services.broker.list_pending().await.is_empty());
}

/// A due daily trigger promotes the entry, runs it through the queue, and
/// reverts the entry to pending with `last_run` stamped.
#[tokio::test]
async fn daily_trigger_runs_document_agent_to_completion() {
    let doc = "---\nagents:\n- agent: agents/reflect.md\n  status: pending\n  trigger: \"daily@00:00\"\n---\n# Today\n\nbody line\n";
    let h = harness(vec![MockTurn::text("Reflection added.")], 3).await;
    h.vault.write("daily/today.md", doc).await.unwrap();

    let report = h.orchestrator.run_trigger_pass().await;
    assert_eq!(report.promoted, 1);
    assert_eq!(report.enqueued, 1);

    let agents = h
        .services
        .scanner
        .get_document_agents("daily/today.md")
        .await
        .unwrap();
    assert_eq!(agents[0].status, AgentStatus::Running);

    let state = h.services.queue.get_state().await;
    assert_eq!(
        state.pending[0].context.document_path.as_deref(),
        Some("daily/today.md")
    );

    // Drive the drain loop and wait for completion.
    let handles = h.orchestrator.spawn_loops();
    h.orchestrator.nudge();
    let mut completed = false;
    for _ in 0..100 {
        let state = h.services.queue.get_state().await;
        if state.completed.len() == 1 {
            completed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(completed, "queue item never completed");

    let agents = h
        .services
        .scanner
        .get_document_agents("daily/today.md")
        .await
        .unwrap();
    assert_eq!(agents[0].status, AgentStatus::Pending);
    assert!(agents[0].last_run.is_some());
    assert_eq!(agents[0].last_result.as_deref(), Some("Reflection added."));

    // The stamped last_run keeps the trigger quiet for the rest of the day.
    let report = h.orchestrator.run_trigger_pass().await;
    assert_eq!(report.promoted, 0);

    // Body untouched through the whole lifecycle.
    let content = h.vault.read("daily/today.md").await.unwrap();
    assert!(content.ends_with("# Today\n\nbody line\n"));

    for handle in handles {
        handle.abort();
    }
}

/// Document-bound chat prepends the target document to the model prompt
/// and keys the session by document path.
#[tokio::test]
async fn document_bound_agent_sees_document_body() {
    let h = harness(vec![MockTurn::text("Looks good.")], 3).await;
    h.vault
        .write("daily/today.md", "# Today\n\nimportant contents\n")
        .await
        .unwrap();

    let req = ExecuteRequest {
        agent_path: "agents/reflect.md".to_string(),
        message: "Reflect on this.".to_string(),
        scope: SessionScope {
            session_id: None,
            document_path: Some("daily/today.md".to_string()),
        },
        initial_context: None,
        depth: 0,
    };
    let outcome = h.orchestrator.execute(req).await.unwrap();
    assert!(outcome.success);

    let queries = h.llm.recorded_queries();
    assert!(queries[0].prompt.contains("important contents"));
    assert!(queries[0].prompt.contains("Reflect on this."));

    // The persisted user message is the verbatim submission.
    let sessions = h.services.sessions.list().await;
    assert_eq!(sessions.len(), 1);
    let session = h
        .services
        .sessions
        .get_by_id(&sessions[0].id)
        .await
        .unwrap();
    assert_eq!(session.key.discriminator, "daily/today.md");
    assert_eq!(session.messages[0].content, "Reflect on this.");
}

/// A stale upstream handle is dropped the moment a resume is rejected,
/// and the fallback query's handle takes its place.
#[tokio::test]
async fn stale_handle_is_dropped_on_resume_rejection() {
    let h = harness(vec![], 3).await;
    h.llm.push_turn(MockTurn {
        text: "recovered".to_string(),
        tool_uses: Vec::new(),
        session_id: None,
    });

    let (session, _) = h
        .services
        .sessions
        .get_or_create(
            &h.services.agents.load("agents/helper.md").await.unwrap(),
            &SessionScope {
                session_id: Some("s1".to_string()),
                document_path: None,
            },
        )
        .await
        .unwrap();
    h.services
        .sessions
        .update_upstream_handle(&session.key, Some("stale"))
        .await
        .unwrap();
    h.llm.set_reject_resume(true);

    let outcome = h
        .orchestrator
        .execute(chat_request("hello", "s1"))
        .await
        .unwrap();
    assert!(outcome.success);

    let (reloaded, _) = h
        .services
        .sessions
        .get_or_create(
            &h.services.agents.load("agents/helper.md").await.unwrap(),
            &SessionScope {
                session_id: Some("s1".to_string()),
                document_path: None,
            },
        )
        .await
        .unwrap();
    // The handle now reflects the fallback query's new upstream session,
    // not the stale one.
    assert_ne!(reloaded.upstream_session_id.as_deref(), Some("stale"));
}
