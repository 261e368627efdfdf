//! Protocol-engine properties over the in-process channel binding: each
//! caller resolves exactly once against its own correlation id regardless of
//! response order, timeouts free their table entries, and teardown rejects
//! everything outstanding.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use disegno::protocol::{HostMessage, SandboxMessage};
use disegno::{
    ChannelLauncher, DiagramService, RenderError, RenderMethod, RenderOptions, RendererConfig,
    RendererConfigPatch, SandboxClient, SandboxEndpoint, Settings,
};

fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.sandbox.ready_timeout = Duration::from_millis(500);
    settings.sandbox.render_timeout = Duration::from_millis(500);
    settings.sandbox.control_timeout = Duration::from_millis(500);
    settings
}

/// Replies to everything immediately: renders echo their diagram text.
fn spawn_echo(mut endpoint: SandboxEndpoint) {
    tokio::spawn(async move {
        let _ = endpoint.replies.send(SandboxMessage::Ready).await;
        while let Some(message) = endpoint.requests.recv().await {
            match message {
                HostMessage::Render {
                    request_id,
                    diagram_text,
                } => {
                    let _ = endpoint
                        .replies
                        .send(SandboxMessage::RenderResult {
                            request_id,
                            success: true,
                            svg: Some(format!("<svg>{diagram_text}</svg>")),
                            error: None,
                            method: Some(RenderMethod::Direct),
                        })
                        .await;
                }
                HostMessage::ConfigUpdate { .. } => {
                    let _ = endpoint
                        .replies
                        .send(SandboxMessage::ConfigUpdated {
                            success: true,
                            error: None,
                        })
                        .await;
                }
                HostMessage::Ping => {
                    let _ = endpoint.replies.send(SandboxMessage::Pong).await;
                }
            }
        }
    });
}

fn echo_service() -> DiagramService {
    DiagramService::with_launcher(test_settings(), Arc::new(ChannelLauncher::new(spawn_echo)))
}

#[tokio::test]
async fn render_round_trip() {
    let service = echo_service();

    let result = service
        .render("d1", "graph TD; A-->B", &RenderOptions::default())
        .await
        .expect("echo sandbox renders");

    assert_eq!(result.svg, "<svg>graph TD; A-->B</svg>");
    assert_eq!(result.method, Some(RenderMethod::Direct));
}

#[tokio::test]
async fn correlation_integrity_with_out_of_order_responses() {
    // Collects three render requests, then answers them in reverse order.
    let spawn = |mut endpoint: SandboxEndpoint| {
        tokio::spawn(async move {
            let _ = endpoint.replies.send(SandboxMessage::Ready).await;
            let mut held = Vec::new();
            while let Some(message) = endpoint.requests.recv().await {
                if let HostMessage::Render {
                    request_id,
                    diagram_text,
                } = message
                {
                    held.push((request_id, diagram_text));
                    if held.len() == 3 {
                        for (request_id, diagram_text) in held.drain(..).rev() {
                            let _ = endpoint
                                .replies
                                .send(SandboxMessage::RenderResult {
                                    request_id,
                                    success: true,
                                    svg: Some(format!("<svg>{diagram_text}</svg>")),
                                    error: None,
                                    method: None,
                                })
                                .await;
                        }
                    }
                }
            }
        });
    };
    let service =
        DiagramService::with_launcher(test_settings(), Arc::new(ChannelLauncher::new(spawn)));

    let options = RenderOptions::default();
    let (first, second, third) = tokio::join!(
        service.render("a", "alpha", &options),
        service.render("b", "beta", &options),
        service.render("c", "gamma", &options),
    );

    assert_eq!(first.expect("first resolves").svg, "<svg>alpha</svg>");
    assert_eq!(second.expect("second resolves").svg, "<svg>beta</svg>");
    assert_eq!(third.expect("third resolves").svg, "<svg>gamma</svg>");
}

#[tokio::test]
async fn timeout_rejects_and_late_response_is_discarded() {
    // First render is answered far too late; later renders echo immediately.
    let spawn = |mut endpoint: SandboxEndpoint| {
        tokio::spawn(async move {
            let _ = endpoint.replies.send(SandboxMessage::Ready).await;
            let mut first = true;
            while let Some(message) = endpoint.requests.recv().await {
                if let HostMessage::Render {
                    request_id,
                    diagram_text,
                } = message
                {
                    let replies = endpoint.replies.clone();
                    let delay = if first {
                        Duration::from_millis(300)
                    } else {
                        Duration::ZERO
                    };
                    first = false;
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = replies
                            .send(SandboxMessage::RenderResult {
                                request_id,
                                success: true,
                                svg: Some(format!("<svg>{diagram_text}</svg>")),
                                error: None,
                                method: None,
                            })
                            .await;
                    });
                }
            }
        });
    };
    let service =
        DiagramService::with_launcher(test_settings(), Arc::new(ChannelLauncher::new(spawn)));

    let timed_out = service
        .render(
            "slow",
            "late",
            &RenderOptions::default().timeout(Duration::from_millis(100)),
        )
        .await;
    assert!(matches!(timed_out, Err(RenderError::RenderTimeout)));

    // The late response for the abandoned id must be silently discarded and
    // must not satisfy (or corrupt) this request.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let next = service
        .render("fast", "prompt", &RenderOptions::default())
        .await
        .expect("renderer survives a discarded late response");
    assert_eq!(next.svg, "<svg>prompt</svg>");
}

#[tokio::test]
async fn render_failure_carries_the_sandbox_message() {
    let spawn = |mut endpoint: SandboxEndpoint| {
        tokio::spawn(async move {
            let _ = endpoint.replies.send(SandboxMessage::Ready).await;
            while let Some(message) = endpoint.requests.recv().await {
                if let HostMessage::Render { request_id, .. } = message {
                    let _ = endpoint
                        .replies
                        .send(SandboxMessage::RenderResult {
                            request_id,
                            success: false,
                            svg: None,
                            error: Some("unknown diagram type".to_owned()),
                            method: None,
                        })
                        .await;
                }
            }
        });
    };
    let service =
        DiagramService::with_launcher(test_settings(), Arc::new(ChannelLauncher::new(spawn)));

    let error = service
        .render("bad", "???", &RenderOptions::default())
        .await
        .expect_err("sandbox failure propagates");
    match error {
        RenderError::RenderFailed { message } => assert_eq!(message, "unknown diagram type"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn initialization_race_creates_exactly_one_sandbox() {
    let launches = Arc::new(AtomicUsize::new(0));
    let spawn = {
        let launches = Arc::clone(&launches);
        move |endpoint: SandboxEndpoint| {
            launches.fetch_add(1, Ordering::SeqCst);
            spawn_echo(endpoint);
        }
    };
    let service =
        DiagramService::with_launcher(test_settings(), Arc::new(ChannelLauncher::new(spawn)));

    let options = RenderOptions::default();
    let (first, second) = tokio::join!(
        service.render("x", "one", &options),
        service.render("y", "two", &options),
    );

    assert!(first.is_ok());
    assert!(second.is_ok());
    assert_eq!(launches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn initialization_timeout_leaves_room_for_retry() {
    // First worker never signals ready (but keeps the channel open); the
    // replacement behaves.
    let launches = Arc::new(AtomicUsize::new(0));
    let spawn = {
        let launches = Arc::clone(&launches);
        move |mut endpoint: SandboxEndpoint| {
            let attempt = launches.fetch_add(1, Ordering::SeqCst);
            if attempt == 0 {
                tokio::spawn(async move {
                    // Bind the whole endpoint so its reply sender stays alive
                    // for the task's lifetime (disjoint capture would otherwise
                    // drop `replies` and close the channel prematurely).
                    let mut endpoint = endpoint;
                    while endpoint.requests.recv().await.is_some() {}
                });
            } else {
                spawn_echo(endpoint);
            }
        }
    };
    let service =
        DiagramService::with_launcher(test_settings(), Arc::new(ChannelLauncher::new(spawn)));

    let error = service
        .render("d", "first", &RenderOptions::default())
        .await
        .expect_err("first boot must time out");
    assert!(matches!(error, RenderError::InitializationTimeout));

    let retried = service
        .render("d", "second", &RenderOptions::default())
        .await
        .expect("retry boots a fresh worker");
    assert_eq!(retried.svg, "<svg>second</svg>");
    assert_eq!(launches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn destroy_rejects_pending_requests_and_is_idempotent() {
    // Ready, then silent: requests stay pending until teardown.
    let spawn = |mut endpoint: SandboxEndpoint| {
        tokio::spawn(async move {
            let _ = endpoint.replies.send(SandboxMessage::Ready).await;
            while endpoint.requests.recv().await.is_some() {}
        });
    };
    let settings = test_settings();
    let client = Arc::new(SandboxClient::new(
        settings.sandbox.clone(),
        Arc::new(ChannelLauncher::new(spawn)),
        RendererConfig::default(),
    ));

    let pending = {
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            client
                .render(
                    "stuck",
                    "never answered",
                    &RenderOptions::default().timeout(Duration::from_secs(5)),
                )
                .await
        })
    };

    // Let the request reach the pending table before tearing down.
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.destroy();

    let outcome = pending.await.expect("render task completes");
    assert!(matches!(outcome, Err(RenderError::Destroyed)));

    // Idempotent: a second destroy is a no-op, and the dead client stays dead.
    client.destroy();
    let after = client
        .render("late", "after destroy", &RenderOptions::default())
        .await;
    assert!(matches!(after, Err(RenderError::Destroyed)));
}

#[tokio::test]
async fn initialize_replaces_the_previous_client() {
    let launches = Arc::new(AtomicUsize::new(0));
    let spawn = {
        let launches = Arc::clone(&launches);
        move |endpoint: SandboxEndpoint| {
            launches.fetch_add(1, Ordering::SeqCst);
            spawn_echo(endpoint);
        }
    };
    let service =
        DiagramService::with_launcher(test_settings(), Arc::new(ChannelLauncher::new(spawn)));

    service
        .render("a", "one", &RenderOptions::default())
        .await
        .expect("first client renders");

    service.initialize(RendererConfig::default()).await;

    service
        .render("b", "two", &RenderOptions::default())
        .await
        .expect("replacement client renders");
    assert_eq!(launches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn update_config_replaces_the_snapshot_only_on_ack() {
    let spawn_rejecting = |mut endpoint: SandboxEndpoint| {
        tokio::spawn(async move {
            let _ = endpoint.replies.send(SandboxMessage::Ready).await;
            while let Some(message) = endpoint.requests.recv().await {
                if let HostMessage::ConfigUpdate { .. } = message {
                    let _ = endpoint
                        .replies
                        .send(SandboxMessage::ConfigUpdated {
                            success: false,
                            error: Some("unsupported option".to_owned()),
                        })
                        .await;
                }
            }
        });
    };
    let settings = test_settings();

    let accepting = SandboxClient::new(
        settings.sandbox.clone(),
        Arc::new(ChannelLauncher::new(spawn_echo)),
        RendererConfig::default(),
    );
    accepting.initialize().await.expect("echo sandbox boots");
    accepting
        .update_config(RendererConfigPatch::default().theme("dark"))
        .await
        .expect("echo sandbox acks config updates");
    assert_eq!(accepting.config().theme, "dark");

    let rejecting = SandboxClient::new(
        settings.sandbox.clone(),
        Arc::new(ChannelLauncher::new(spawn_rejecting)),
        RendererConfig::default(),
    );
    rejecting.initialize().await.expect("sandbox boots");
    let error = rejecting
        .update_config(RendererConfigPatch::default().theme("dark"))
        .await
        .expect_err("rejected update surfaces");
    match error {
        RenderError::ConfigUpdateFailed { message } => assert_eq!(message, "unsupported option"),
        other => panic!("unexpected error: {other}"),
    }
    // The in-memory snapshot is untouched on failure.
    assert_eq!(rejecting.config().theme, "default");
}

#[tokio::test]
async fn control_operations_require_an_initialized_client() {
    let service = echo_service();

    let config_error = service
        .update_config(RendererConfigPatch::default().theme("dark"))
        .await
        .expect_err("no client exists yet");
    assert!(matches!(config_error, RenderError::ChannelUnavailable));

    let ping_error = service.ping().await.expect_err("no client exists yet");
    assert!(matches!(ping_error, RenderError::ChannelUnavailable));
}

#[tokio::test]
async fn ping_reports_round_trip_latency() {
    let service = echo_service();
    service
        .render("warmup", "boot", &RenderOptions::default())
        .await
        .expect("echo sandbox renders");

    let latency = service.ping().await.expect("echo sandbox answers pings");
    assert!(latency < Duration::from_millis(500));
}

#[tokio::test]
async fn ping_timeout_surfaces_as_ping_timeout() {
    // Answers renders but never pongs.
    let spawn = |mut endpoint: SandboxEndpoint| {
        tokio::spawn(async move {
            let _ = endpoint.replies.send(SandboxMessage::Ready).await;
            while let Some(message) = endpoint.requests.recv().await {
                if let HostMessage::Render { request_id, .. } = message {
                    let _ = endpoint
                        .replies
                        .send(SandboxMessage::RenderResult {
                            request_id,
                            success: true,
                            svg: Some("<svg/>".to_owned()),
                            error: None,
                            method: None,
                        })
                        .await;
                }
            }
        });
    };
    let settings = test_settings();
    let client = SandboxClient::new(
        settings.sandbox.clone(),
        Arc::new(ChannelLauncher::new(spawn)),
        RendererConfig::default(),
    );
    client.initialize().await.expect("sandbox boots");

    let error = client.ping().await.expect_err("ping must time out");
    assert!(matches!(error, RenderError::PingTimeout));
}
