// MIT License
// Copyright 2023--present potserve developers

#![cfg(unix)]

use std::os::unix::process::ExitStatusExt;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use signal_hook::consts::SIGINT;
use signal_hook::low_level::raise;

use potserve_core::config::ServerConfig;
use potserve_core::net::Server;
use potserve_core::potential::{Evaluation, FnPotential, ForceInput};

const CHILD_ENV: &str = "POTSERVE_SIGINT_CHILD";

/// Body of the child process started by `sigint_terminates_after_serving`.
#[test]
#[ignore = "runs in a subprocess"]
fn serve_then_interrupt() {
    if std::env::var_os(CHILD_ENV).is_none() {
        return;
    }
    let config = ServerConfig {
        port: 0,
        poll_interval_s: 0.05,
        ..Default::default()
    };
    let zeros = Arc::new(FnPotential::new("zeros", |input: &ForceInput<'_>| {
        Ok(Evaluation::zeros(input.n_atoms()))
    }));
    let mut server = Server::new(config, zeros);
    let control = server.control();

    let stopper = std::thread::spawn(move || {
        while !control.is_listening() {
            std::thread::sleep(Duration::from_millis(10));
        }
        // While serving, an interrupt is only a reload request.
        raise(SIGINT).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        println!("survived interrupt while serving");
        control.request_shutdown();
    });
    server.serve_blocking(true).unwrap();
    stopper.join().unwrap();
    println!("serving finished");

    raise(SIGINT).unwrap();
    std::thread::sleep(Duration::from_millis(500));
    println!("still alive after interrupt");
}

#[test]
fn sigint_terminates_after_serving() {
    let output = Command::new(std::env::current_exe().unwrap())
        .args(["serve_then_interrupt", "--exact", "--ignored", "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, "1")
        .output()
        .unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(stdout.contains("survived interrupt while serving"), "{stdout}");
    assert!(stdout.contains("serving finished"), "{stdout}");
    assert!(!stdout.contains("still alive after interrupt"), "{stdout}");
    assert_eq!(output.status.signal(), Some(SIGINT));
}
