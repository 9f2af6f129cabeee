//! Integration tests for the provisioning workflow.
//!
//! The provider and shell are scripted fakes; polling runs on millisecond
//! intervals.

mod common;

use std::time::Duration;

use common::{
    instance, instance_type, test_config, test_templates, Call, Create, FakeProvider, FakeShell,
    Listing, Reply,
};
use spot::launcher::{LaunchError, Launcher, Outcome, RunState, ScriptTemplates, LAUNCH_COMMAND};
use spot::providers::InstanceStatus;
use spot::remote::RemoteStep;

fn catalog() -> Vec<spot::providers::InstanceType> {
    vec![
        instance_type("1A100.40S.22V", "1x A100 SXM4 40GB", 0.5),
        instance_type("1H100.80S.30V", "1x H100 SXM5 80GB", 0.9),
        instance_type("1H100.80S.32V", "1x H100 SXM5 80GB", 0.8),
    ]
}

fn ready_listing() -> Listing {
    Listing::Instances(vec![instance(
        "inst-1",
        InstanceStatus::Running,
        Some("203.0.113.7"),
    )])
}

fn installed_shell() -> FakeShell {
    FakeShell::replying(vec![
        Reply::Outputs(vec!["ready\n".to_string()]),
        Reply::Outputs(vec![String::new(); 3]),
    ])
}

// =============================================================================
// Full runs
// =============================================================================

#[tokio::test]
async fn test_full_run_launches_training() {
    let provider = FakeProvider::with_catalog(catalog()).listing(vec![
        Listing::Instances(vec![instance("inst-1", InstanceStatus::Provisioning, None)]),
        Listing::Instances(vec![instance("inst-1", InstanceStatus::Running, Some(""))]),
        ready_listing(),
    ]);
    let shell = FakeShell::replying(vec![
        Reply::Refused,
        Reply::Outputs(vec![String::new()]),
        Reply::Outputs(vec!["ready\n".to_string()]),
        Reply::Outputs(vec![String::new(); 3]),
    ]);
    let config = test_config();

    let mut launcher = Launcher::new(&provider, &shell, &config, test_templates());
    let summary = launcher.run().await.unwrap();

    assert_eq!(summary.instance_id, "inst-1");
    assert_eq!(summary.ip, "203.0.113.7");
    assert_eq!(summary.instance_type.name, "1H100.80S.30V");
    assert_eq!(launcher.state(), RunState::Done);
    assert!(provider.deletions().is_empty());

    let calls = provider.calls();
    let script = calls
        .iter()
        .find_map(|c| match c {
            Call::CreateScript { name, script } => Some((name.clone(), script.clone())),
            _ => None,
        })
        .unwrap();
    assert!(script.0.starts_with("lerobot-install-"));
    assert_eq!(script.1, "hf=hf-token wandb=wandb-token");

    let sessions = shell.sessions();
    assert_eq!(sessions.len(), 4);
    assert!(sessions.iter().all(|(host, _)| host == "203.0.113.7"));
    let (_, steps) = sessions.last().unwrap();
    assert_eq!(
        steps,
        &vec![
            RemoteStep::Upload {
                path: "/root/train.sh".to_string(),
                contents: "id=client-id secret=client-secret instance=inst-1".to_string(),
            },
            RemoteStep::Exec("chmod +x /root/train.sh".to_string()),
            RemoteStep::Spawn(LAUNCH_COMMAND.to_string()),
        ]
    );
}

#[tokio::test]
async fn test_no_suitable_instance_creates_nothing() {
    let provider = FakeProvider::with_catalog(vec![instance_type(
        "1H100.80S.30V",
        "1x H100 SXM5 80GB",
        2.0,
    )]);
    let shell = FakeShell::default();
    let config = test_config();

    let mut launcher = Launcher::new(&provider, &shell, &config, test_templates());
    let err = launcher.run().await.unwrap_err();

    assert!(matches!(err, LaunchError::NoSuitableInstance { .. }), "{err}");
    assert_eq!(provider.calls(), vec![Call::ListInstanceTypes]);
    assert_eq!(launcher.state(), RunState::Failed);
    assert!(shell.sessions().is_empty());
}

// =============================================================================
// Instance creation
// =============================================================================

#[tokio::test]
async fn test_rejected_locations_fall_through_to_next() {
    let provider = FakeProvider::with_catalog(catalog()).creating(vec![
        Create::Rejected,
        Create::Rejected,
        Create::Rejected,
        Create::Created("inst-9".to_string()),
    ]);
    let shell = FakeShell::default();
    let config = test_config();

    let mut launcher = Launcher::new(&provider, &shell, &config, test_templates());
    let chosen = launcher.select_instance_type().await.unwrap();
    let id = launcher.create_instance(&chosen).await.unwrap();

    assert_eq!(id, "inst-9");
    assert_eq!(launcher.session().instance_id(), Some("inst-9"));
    assert_eq!(launcher.session().startup_script_id(), Some("script-1"));

    let locations: Vec<_> = provider
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            Call::CreateInstance {
                location,
                script_id,
            } => {
                assert_eq!(script_id.as_deref(), Some("script-1"));
                Some(location)
            }
            _ => None,
        })
        .collect();
    assert_eq!(locations, vec!["FIN-01", "FIN-02", "FIN-03", "ICE-01"]);
}

#[tokio::test]
async fn test_all_locations_rejected_deletes_script() {
    let provider =
        FakeProvider::with_catalog(catalog()).creating(vec![Create::Rejected; 4]);
    let shell = FakeShell::default();
    let config = test_config();

    let mut launcher = Launcher::new(&provider, &shell, &config, test_templates());
    let err = launcher.run().await.unwrap_err();

    match err {
        LaunchError::NoLocationAvailable(locations) => assert_eq!(locations.len(), 4),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(provider.deletions(), vec![Call::DeleteScript("script-1".to_string())]);
    assert!(!launcher.session().has_resources());
    assert_eq!(launcher.state(), RunState::Failed);
}

#[tokio::test]
async fn test_non_rejection_error_stops_location_loop() {
    let provider = FakeProvider::with_catalog(catalog()).creating(vec![Create::Broken]);
    let shell = FakeShell::default();
    let config = test_config();

    let mut launcher = Launcher::new(&provider, &shell, &config, test_templates());
    let err = launcher.run().await.unwrap_err();

    assert!(matches!(err, LaunchError::Provider(_)), "{err}");
    let creates = provider
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::CreateInstance { .. }))
        .count();
    assert_eq!(creates, 1);
    assert_eq!(provider.deletions(), vec![Call::DeleteScript("script-1".to_string())]);
}

// =============================================================================
// Readiness
// =============================================================================

#[tokio::test]
async fn test_ready_timeout_cleans_up_everything() {
    let provider = FakeProvider::with_catalog(catalog()).listing(vec![Listing::Instances(vec![
        instance("inst-1", InstanceStatus::Provisioning, None),
    ])]);
    let shell = FakeShell::default();
    let config = test_config();

    let mut launcher = Launcher::new(&provider, &shell, &config, test_templates());
    let err = launcher.run().await.unwrap_err();

    assert!(
        matches!(err, LaunchError::Timeout { stage: "instance to become ready", .. }),
        "{err}"
    );
    assert_eq!(
        provider.deletions(),
        vec![
            Call::DeleteInstance("inst-1".to_string()),
            Call::DeleteScript("script-1".to_string()),
        ]
    );
    assert!(!launcher.session().has_resources());
    assert!(shell.sessions().is_empty());
}

#[tokio::test]
async fn test_vanished_instance_is_fatal() {
    let provider =
        FakeProvider::with_catalog(catalog()).listing(vec![Listing::Instances(Vec::new())]);
    let shell = FakeShell::default();
    let config = test_config();

    let mut launcher = Launcher::new(&provider, &shell, &config, test_templates());
    let err = launcher.run().await.unwrap_err();

    assert!(matches!(err, LaunchError::InstanceNotFound(ref id) if id == "inst-1"), "{err}");
    assert!(provider
        .deletions()
        .contains(&Call::DeleteInstance("inst-1".to_string())));
}

#[tokio::test]
async fn test_listing_errors_are_retried() {
    let provider = FakeProvider::with_catalog(catalog())
        .listing(vec![Listing::Failed, Listing::Failed, ready_listing()]);
    let shell = installed_shell();
    let config = test_config();

    let mut launcher = Launcher::new(&provider, &shell, &config, test_templates());
    launcher.run().await.unwrap();

    let listings = provider
        .calls()
        .into_iter()
        .filter(|c| *c == Call::ListInstances)
        .count();
    assert_eq!(listings, 3);
}

// =============================================================================
// Installation
// =============================================================================

#[tokio::test]
async fn test_authentication_failure_is_not_retried() {
    let provider = FakeProvider::with_catalog(catalog()).listing(vec![ready_listing()]);
    let shell = FakeShell::replying(vec![Reply::Denied]);
    let config = test_config();

    let mut launcher = Launcher::new(&provider, &shell, &config, test_templates());
    let err = launcher.run().await.unwrap_err();

    assert!(matches!(err, LaunchError::Remote(ref e) if e.is_authentication()), "{err}");
    assert_eq!(shell.sessions().len(), 1);
    assert_eq!(provider.deletions().len(), 2);
}

#[tokio::test]
async fn test_install_timeout_when_sentinel_never_appears() {
    let provider = FakeProvider::with_catalog(catalog()).listing(vec![ready_listing()]);
    let shell = FakeShell::replying(vec![Reply::Refused]);
    let config = test_config();

    let mut launcher = Launcher::new(&provider, &shell, &config, test_templates());
    let err = launcher.run().await.unwrap_err();

    assert!(matches!(err, LaunchError::Timeout { stage: "installation", .. }), "{err}");
    assert!(shell.sessions().len() > 1);
    assert_eq!(provider.deletions().len(), 2);
    assert_eq!(launcher.state(), RunState::Failed);
}

#[tokio::test]
async fn test_steps_out_of_order_are_refused() {
    let provider = FakeProvider::with_catalog(catalog());
    let shell = FakeShell::default();
    let config = test_config();

    let mut launcher = Launcher::new(&provider, &shell, &config, test_templates());
    assert!(matches!(
        launcher.wait_until_ready().await,
        Err(LaunchError::NotProvisioned(_))
    ));
    assert!(matches!(
        launcher.start_training().await,
        Err(LaunchError::NotProvisioned(_))
    ));
    assert!(provider.calls().is_empty());
}

// =============================================================================
// Interrupts
// =============================================================================

#[tokio::test]
async fn test_interrupt_with_confirmed_cleanup() {
    let provider = FakeProvider::with_catalog(catalog()).listing(vec![ready_listing()]);
    let shell = FakeShell::replying(vec![Reply::Hang]);
    let config = test_config();

    let mut launcher = Launcher::new(&provider, &shell, &config, test_templates());
    let outcome = launcher
        .run_interruptible(tokio::time::sleep(Duration::from_millis(50)), || true)
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Interrupted { cleaned_up: true });
    assert_eq!(
        provider.deletions(),
        vec![
            Call::DeleteInstance("inst-1".to_string()),
            Call::DeleteScript("script-1".to_string()),
        ]
    );
    assert_eq!(launcher.state(), RunState::Failed);
}

#[tokio::test]
async fn test_interrupt_declined_leaves_resources() {
    let provider = FakeProvider::with_catalog(catalog()).listing(vec![ready_listing()]);
    let shell = FakeShell::replying(vec![Reply::Hang]);
    let config = test_config();

    let mut launcher = Launcher::new(&provider, &shell, &config, test_templates());
    let outcome = launcher
        .run_interruptible(tokio::time::sleep(Duration::from_millis(50)), || false)
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Interrupted { cleaned_up: false });
    assert!(provider.deletions().is_empty());
    assert_eq!(launcher.session().instance_id(), Some("inst-1"));
    assert_eq!(launcher.state(), RunState::Installing);
}

#[tokio::test]
async fn test_uninterrupted_run_completes() {
    let provider = FakeProvider::with_catalog(catalog()).listing(vec![ready_listing()]);
    let shell = installed_shell();
    let config = test_config();

    let mut launcher = Launcher::new(&provider, &shell, &config, test_templates());
    let outcome = launcher
        .run_interruptible(std::future::pending::<()>(), || panic!("not interrupted"))
        .await
        .unwrap();

    match outcome {
        Outcome::Completed(summary) => assert_eq!(summary.ip, "203.0.113.7"),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn test_interrupt_during_failure_cleanup_still_deletes_instance() {
    let provider = FakeProvider {
        instance_delete_delay: Some(Duration::from_millis(300)),
        ..FakeProvider::with_catalog(catalog()).listing(vec![ready_listing()])
    };
    let shell = FakeShell::replying(vec![Reply::Denied]);
    let config = test_config();

    let mut launcher = Launcher::new(&provider, &shell, &config, test_templates());
    let outcome = launcher
        .run_interruptible(tokio::time::sleep(Duration::from_millis(50)), || true)
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Interrupted { cleaned_up: true });
    assert_eq!(
        provider.deletions(),
        vec![
            Call::DeleteInstance("inst-1".to_string()),
            Call::DeleteScript("script-1".to_string()),
        ]
    );
    assert!(!launcher.session().has_resources());
}

// =============================================================================
// Shipped script templates
// =============================================================================

fn shipped_templates() -> ScriptTemplates {
    let scripts = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../scripts");
    let mut config = test_config();
    config.install_script = scripts.join("install_lerobot.sh");
    config.train_script = scripts.join("train.sh");
    ScriptTemplates::load(&config).unwrap()
}

const FILLED_PLACEHOLDERS: [&str; 5] = [
    "${HUGGINGFACE_TOKEN}",
    "${WANDB_TOKEN}",
    "${DATACRUNCH_CLIENT_ID}",
    "${DATACRUNCH_CLIENT_SECRET}",
    "${INSTANCE_ID}",
];

#[tokio::test]
async fn test_shipped_scripts_are_fully_rendered() {
    let provider = FakeProvider::with_catalog(catalog()).listing(vec![ready_listing()]);
    let shell = installed_shell();
    let config = test_config();

    let mut launcher = Launcher::new(&provider, &shell, &config, shipped_templates());
    launcher.run().await.unwrap();

    let install = provider
        .calls()
        .into_iter()
        .find_map(|c| match c {
            Call::CreateScript { script, .. } => Some(script),
            _ => None,
        })
        .unwrap();
    assert!(install.contains("hf-token"));
    assert!(install.contains("wandb-token"));

    let (_, steps) = shell.sessions().pop().unwrap();
    let train = match &steps[0] {
        RemoteStep::Upload { contents, .. } => contents.clone(),
        other => panic!("unexpected first step: {other:?}"),
    };
    assert!(train.contains("client-id"));
    assert!(train.contains("client-secret"));
    assert!(train.contains("inst-1"));

    for placeholder in FILLED_PLACEHOLDERS {
        assert!(!install.contains(placeholder), "install script still has {placeholder}");
        assert!(!train.contains(placeholder), "training script still has {placeholder}");
    }
}
