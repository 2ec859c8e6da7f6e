mod side_effect;

use super::*;

use crate::service_protocol::messages::{
    output_entry_message, EndMessage, Failure, InputEntryMessage, OutputEntryMessage,
    ProtocolMessage, StartMessage, SuspensionMessage, WriteableMessage,
};
use crate::service_protocol::{Decoder, Encoder, RawMessage, Version};
use bytes::Bytes;
use googletest::prelude::*;
use test_log::test;

// --- Test infra

impl CoreVM {
    fn mock_init() -> CoreVM {
        Self::mock_init_with_options(Default::default())
    }

    fn mock_init_with_options(options: VMOptions) -> CoreVM {
        let vm = CoreVM::new(
            vec![(
                "content-type".to_owned(),
                Version::maximum_supported_version().to_string(),
            )],
            options,
        )
        .unwrap();

        assert_that!(
            vm.get_response_head().headers,
            contains(eq(Header {
                key: Cow::Borrowed("content-type"),
                value: Cow::Borrowed(Version::maximum_supported_version().content_type())
            }))
        );

        vm
    }
}

struct VMTestCase {
    encoder: Encoder,
    vm: CoreVM,
}

impl VMTestCase {
    fn new() -> Self {
        Self {
            encoder: Encoder::new(Version::maximum_supported_version()),
            vm: CoreVM::mock_init(),
        }
    }

    fn with_vm_options(options: VMOptions) -> Self {
        Self {
            encoder: Encoder::new(Version::maximum_supported_version()),
            vm: CoreVM::mock_init_with_options(options),
        }
    }

    fn input<M: WriteableMessage>(mut self, m: M) -> Self {
        self.vm.notify_input(self.encoder.encode(&m));
        self
    }

    fn run(mut self, user_code: impl FnOnce(&mut CoreVM)) -> OutputIterator {
        self.vm.notify_input_closed();
        assert!(self.vm.is_ready_to_execute().unwrap());

        user_code(&mut self.vm);

        OutputIterator::collect_vm(&mut self.vm)
    }

    fn run_without_closing_input(
        mut self,
        user_code: impl FnOnce(&mut CoreVM, &Encoder),
    ) -> OutputIterator {
        assert!(self.vm.is_ready_to_execute().unwrap());

        user_code(&mut self.vm, &self.encoder);

        OutputIterator::collect_vm(&mut self.vm)
    }
}

struct OutputIterator(Decoder);

impl OutputIterator {
    fn collect_vm(vm: &mut impl VM) -> Self {
        let mut decoder = Decoder::new(Version::maximum_supported_version());
        while let TakeOutputResult::Buffer(b) = vm.take_output() {
            decoder.push(b);
        }
        assert_eq!(vm.take_output(), TakeOutputResult::EOF);

        Self(decoder)
    }

    fn next_decoded<M: ProtocolMessage>(&mut self) -> Option<M> {
        self.0
            .consume_next()
            .unwrap()
            .map(|msg| msg.decode_to::<M>().unwrap())
    }
}

impl Iterator for OutputIterator {
    type Item = RawMessage;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.consume_next().unwrap()
    }
}

// --- Matchers

/// Matcher for Error
pub fn eq_error(vm_error: Error) -> impl Matcher<ActualT = Error> {
    pat!(Error {
        code: eq(vm_error.code),
        message: eq(vm_error.message),
    })
}

pub fn is_suspended() -> impl Matcher<ActualT = SuspendedOrVMError> {
    predicate(|e: &SuspendedOrVMError| matches!(e, SuspendedOrVMError::Suspended(_)))
        .with_description("is suspended error", "is not suspended error")
}

pub fn suspended_on(entry_indexes: Vec<u32>) -> impl Matcher<ActualT = SuspensionMessage> {
    pat!(SuspensionMessage {
        entry_indexes: eq(entry_indexes),
    })
}

pub fn is_output_with_success(b: impl AsRef<[u8]>) -> impl Matcher<ActualT = OutputEntryMessage> {
    pat!(OutputEntryMessage {
        result: some(pat!(output_entry_message::Result::Value(eq(
            Bytes::copy_from_slice(b.as_ref())
        ))))
    })
}

pub fn is_output_with_failure(
    code: u16,
    message: impl Into<String>,
) -> impl Matcher<ActualT = OutputEntryMessage> {
    pat!(OutputEntryMessage {
        result: some(pat!(output_entry_message::Result::Failure(eq(Failure {
            code: code as u32,
            message: message.into(),
        }))))
    })
}

// --- Mocks

pub fn start_message(known_entries: u32) -> StartMessage {
    StartMessage {
        id: Bytes::from_static(b"123"),
        debug_id: "123".to_string(),
        known_entries,
        state_map: vec![],
        partial_state: true,
        key: "".to_string(),
    }
}

pub fn input_entry_message(b: impl AsRef<[u8]>) -> InputEntryMessage {
    InputEntryMessage {
        headers: vec![],
        value: Bytes::copy_from_slice(b.as_ref()),
    }
}

/// Asserts the fatal tail of the output stream: a terminal output failure
/// followed by the end message.
fn assert_output_failure_and_end(
    output: &mut OutputIterator,
    code: u16,
    message: impl Into<String>,
) {
    assert_that!(
        output.next_decoded::<OutputEntryMessage>().unwrap(),
        is_output_with_failure(code, message)
    );
    assert_eq!(
        output.next_decoded::<EndMessage>().unwrap(),
        EndMessage::default()
    );
    assert_eq!(output.next(), None);
}

#[test]
fn take_output_on_newly_initialized_vm() {
    let mut vm = CoreVM::mock_init();
    assert_that!(
        vm.take_output(),
        eq(TakeOutputResult::Buffer(Bytes::default()))
    );
}

#[test]
fn missing_content_type() {
    assert_that!(
        CoreVM::new(Vec::<(String, String)>::new(), VMOptions::default()),
        err(eq_error(crate::vm::errors::MISSING_CONTENT_TYPE))
    );
}

#[test]
fn unsupported_content_type() {
    let res = CoreVM::new(
        vec![(
            "content-type".to_owned(),
            "application/vnd.restate.invocation.v9".to_owned(),
        )],
        VMOptions::default(),
    );
    assert_eq!(
        res.unwrap_err().code(),
        error::codes::UNSUPPORTED_MEDIA_TYPE.code()
    );
}

#[test]
fn response_head_identifies_the_sdk() {
    let vm = CoreVM::mock_init();
    let head = vm.get_response_head();

    assert_eq!(head.status_code, 200);
    assert_that!(
        head.headers,
        contains(pat!(Header {
            key: eq(Cow::Borrowed("x-restate-server")),
        }))
    );
}
