// Copyright (C) 2025 The Kraken CI Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Frames over a real TCP connection, the way kktool reports back to the agent.

use kraken_protocol::{FrameError, FramedStream, StepResult, StepState};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};

#[tokio::test]
async fn test_partial_results_arrive_in_emission_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let tool = tokio::spawn(async move {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = FramedStream::new(stream);
        for i in 0..5 {
            let partial = StepResult::in_progress()
                .with("test-results", json!([{"test": format!("t{}", i), "status": 1}]));
            framed.write_frame(&partial).await.unwrap();
        }
        framed.write_frame(&StepResult::done()).await.unwrap();
    });

    let (socket, _) = listener.accept().await.unwrap();
    let mut framed = FramedStream::new(socket);
    let mut seen = Vec::new();
    loop {
        match framed.read_frame::<StepResult>().await {
            Ok(frame) if frame.status == StepState::Done => break,
            Ok(frame) => seen.push(frame.test_results().unwrap()[0].test.clone()),
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    tool.await.unwrap();

    assert_eq!(seen, vec!["t0", "t1", "t2", "t3", "t4"]);
    assert!(matches!(
        framed.read_frame::<StepResult>().await,
        Err(FrameError::ConnectionClosed)
    ));
}
