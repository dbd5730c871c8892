use cinder_core::{Action, Operation, ResultCode};

use super::protocol::{
    decode_complete, decode_error, decode_string_list, encode_complete, encode_error,
    encode_string_list, ApplyPackageRequest, Decoder, Encoder, Message, MessageChannel,
    MessageKind,
};

#[test]
fn apply_package_request_round_trip() {
    let request = ApplyPackageRequest {
        variables: vec![
            ("runtime.installed".to_string(), "1".to_string()),
            ("locale".to_string(), "de-DE \u{00e4}\u{00f6}\u{00fc}".to_string()),
        ],
        package_index: 7,
        operation: Operation::Repairing,
        action: Action::Repair,
    };

    let decoded =
        ApplyPackageRequest::decode(&request.encode()).expect("request must round trip");
    assert_eq!(decoded, request);
}

#[test]
fn apply_package_request_round_trip_empty_variables() {
    let request = ApplyPackageRequest {
        variables: Vec::new(),
        package_index: 0,
        operation: Operation::Installing,
        action: Action::Install,
    };

    let decoded =
        ApplyPackageRequest::decode(&request.encode()).expect("request must round trip");
    assert_eq!(decoded, request);
}

#[test]
fn strings_survive_utf16_encoding() {
    let mut encoder = Encoder::new();
    encoder.put_string("payload \u{2713} \u{1F4E6}");
    let bytes = encoder.finish();

    let mut decoder = Decoder::new(&bytes);
    assert_eq!(
        decoder.string().expect("must decode"),
        "payload \u{2713} \u{1F4E6}"
    );
    decoder.finish().expect("no trailing bytes");
}

#[test]
fn decoder_rejects_truncation_and_trailing_bytes() {
    let mut encoder = Encoder::new();
    encoder.put_u32(1234);
    let bytes = encoder.finish();

    let mut truncated = Decoder::new(&bytes[..2]);
    assert!(truncated.u32().is_err());

    let mut trailing = Decoder::new(&bytes);
    let _ = trailing.u8().expect("must read");
    assert!(trailing.finish().is_err());
}

#[test]
fn framing_round_trip() {
    let sent = vec![
        Message::new(MessageKind::Complete, encode_complete(ResultCode::OK)),
        Message::new(
            MessageKind::Error,
            encode_error("runtime", ResultCode::FAILED, "msiexec exited 1603"),
        ),
        Message::empty(MessageKind::Terminate),
    ];

    let mut wire = Vec::new();
    {
        let mut channel = MessageChannel::new(std::io::empty(), &mut wire);
        for message in &sent {
            channel.send(message).expect("must send");
        }
    }

    let mut channel = MessageChannel::new(std::io::Cursor::new(wire), std::io::sink());
    for expected in &sent {
        let received = channel.receive().expect("must receive");
        assert_eq!(&received, expected);
    }

    let complete = decode_complete(&sent[0].payload).expect("must decode");
    assert_eq!(complete, ResultCode::OK);
    let (item_id, code, text) = decode_error(&sent[1].payload).expect("must decode");
    assert_eq!(item_id, "runtime");
    assert_eq!(code, ResultCode::FAILED);
    assert_eq!(text, "msiexec exited 1603");
}

#[test]
fn string_list_round_trip() {
    let files = vec!["a.dll".to_string(), "b.exe".to_string()];
    let decoded = decode_string_list(&encode_string_list(&files)).expect("must decode");
    assert_eq!(decoded, files);

    let empty: Vec<String> = Vec::new();
    let decoded = decode_string_list(&encode_string_list(&empty)).expect("must decode");
    assert!(decoded.is_empty());
}

#[test]
fn unknown_message_type_is_rejected() {
    let mut wire = Vec::new();
    wire.extend_from_slice(&0xdead_u32.to_le_bytes());
    wire.extend_from_slice(&0_u32.to_le_bytes());

    let mut channel = MessageChannel::new(std::io::Cursor::new(wire), std::io::sink());
    let err = channel.receive().expect_err("unknown type must fail");
    assert!(err.to_string().contains("unknown message type"));
}

#[cfg(unix)]
mod bridge {
    use std::os::unix::net::UnixStream;

    use anyhow::Result;
    use cinder_cache::ElevationDelegate;
    use cinder_core::{Action, Operation, ResultCode, Verdict};

    use crate::protocol::ApplyPackageRequest;
    use crate::{
        ElevatedCallbacks, ElevatedController, ElevatedHost, UiRelay, UnelevatedController,
        LOG_LEVEL_INFO,
    };

    #[derive(Default)]
    struct StubHost {
        session_variables: Vec<(String, String)>,
        applied: Vec<(u32, Operation, Action)>,
        observed_cancel: bool,
    }

    impl ElevatedHost for StubHost {
        fn begin_session(&mut self, variables: &[(String, String)]) -> Result<()> {
            self.session_variables = variables.to_vec();
            Ok(())
        }

        fn end_session(&mut self) -> Result<()> {
            Ok(())
        }

        fn suspend_session(&mut self) -> Result<()> {
            Ok(())
        }

        fn resume_session(&mut self) -> Result<()> {
            Ok(())
        }

        fn save_state(&mut self) -> Result<()> {
            Ok(())
        }

        fn is_cached(&mut self, index: usize) -> Result<bool> {
            Ok(index == 0)
        }

        fn verify_and_cache_package(&mut self, _index: usize) -> Result<()> {
            Ok(())
        }

        fn delete_cached_package(&mut self, _index: usize) -> Result<()> {
            Ok(())
        }

        fn delete_temporary_cache_directories(&mut self) -> Result<()> {
            Ok(())
        }

        fn apply_package(
            &mut self,
            request: &ApplyPackageRequest,
            callbacks: &mut dyn ElevatedCallbacks,
        ) -> Result<ResultCode> {
            self.applied.push((
                request.package_index,
                request.operation,
                request.action,
            ));
            callbacks.log(LOG_LEVEL_INFO, "starting package")?;
            for progress in [32_u8, 128, 255] {
                if callbacks.on_progress(progress)?.is_cancel() {
                    self.observed_cancel = true;
                    return Ok(ResultCode::CANCELLED);
                }
            }
            Ok(ResultCode::OK)
        }
    }

    #[derive(Default)]
    struct RecordingUi {
        progress: Vec<u8>,
        logs: Vec<String>,
        cancel_at: Option<u8>,
    }

    impl UiRelay for RecordingUi {
        fn on_progress(&mut self, progress: u8) -> Verdict {
            self.progress.push(progress);
            match self.cancel_at {
                Some(threshold) if progress >= threshold => Verdict::Cancel,
                _ => Verdict::Continue,
            }
        }

        fn on_progress_detail(&mut self, _progress: u8) -> Verdict {
            Verdict::Continue
        }

        fn on_state_change(&mut self, _state: u32, _detail: &str) {}

        fn on_log(&mut self, _level: u8, text: &str) {
            self.logs.push(text.to_string());
        }

        fn on_error(&mut self, _item_id: &str, _code: ResultCode, _text: &str) -> Verdict {
            Verdict::Continue
        }

        fn on_msi_message(&mut self, _text: &str) -> Verdict {
            Verdict::Continue
        }

        fn on_msi_files_in_use(&mut self, _files: &[String]) -> Verdict {
            Verdict::Continue
        }
    }

    fn run_session(
        cancel_at: Option<u8>,
    ) -> (StubHost, RecordingUi, ResultCode, bool, bool) {
        let (unelevated_stream, elevated_stream) =
            UnixStream::pair().expect("must create socket pair");

        let server = std::thread::spawn(move || {
            let reader = elevated_stream
                .try_clone()
                .expect("must clone elevated stream");
            let mut controller = ElevatedController::new(reader, elevated_stream);
            let mut host = StubHost::default();
            controller.serve(&mut host).expect("serve must succeed");
            host
        });

        let reader = unelevated_stream
            .try_clone()
            .expect("must clone unelevated stream");
        let ui = RecordingUi {
            cancel_at,
            ..RecordingUi::default()
        };
        let mut controller = UnelevatedController::new(reader, unelevated_stream, ui);

        let begin = controller
            .begin_session(&[("a".to_string(), "1".to_string())])
            .expect("begin_session must complete");
        assert_eq!(begin, ResultCode::OK);

        let cached_zero = controller.is_cached(0).expect("is_cached must complete");
        let cached_one = controller.is_cached(1).expect("is_cached must complete");

        let code = controller
            .apply_package(&ApplyPackageRequest {
                variables: vec![("a".to_string(), "1".to_string())],
                package_index: 3,
                operation: Operation::Installing,
                action: Action::Install,
            })
            .expect("apply_package must complete");

        controller.terminate().expect("terminate must send");
        let host = server.join().expect("server thread must finish");

        // recover the UI recorder for assertions
        let ui = std::mem::take(controller.ui_mut());
        (host, ui, code, cached_zero, cached_one)
    }

    #[test]
    fn bridge_round_trip_success() {
        let (host, ui, code, cached_zero, cached_one) = run_session(None);

        assert_eq!(code, ResultCode::OK);
        assert!(cached_zero);
        assert!(!cached_one);
        assert_eq!(host.session_variables, vec![("a".to_string(), "1".to_string())]);
        assert_eq!(
            host.applied,
            vec![(3, Operation::Installing, Action::Install)]
        );
        assert!(!host.observed_cancel);
        assert_eq!(ui.progress, vec![32, 128, 255]);
        assert_eq!(ui.logs, vec!["starting package"]);
    }

    #[test]
    fn bridge_relays_cancel_verdict_to_elevated_side() {
        let (host, ui, code, _, _) = run_session(Some(100));

        assert_eq!(code, ResultCode::CANCELLED);
        assert!(host.observed_cancel);
        // the pump stops relaying progress once the cancel verdict is posted
        assert_eq!(ui.progress, vec![32, 128]);
    }
}
