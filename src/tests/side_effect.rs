use super::*;

use crate::service_protocol::messages::{
    completion_message, side_effect_entry_message, CompletionMessage, Empty, EntryAckMessage,
    Failure, SideEffectEntryMessage, SleepEntryMessage,
};
use assert2::let_assert;
use std::time::Duration;
use test_log::test;

fn greet_side_effect_handler(vm: &mut CoreVM) {
    let input = vm.sys_input().unwrap();
    let name = String::from_utf8(input.input.to_vec()).unwrap();

    let result = match vm.sys_side_effect_enter().unwrap() {
        SideEffectEnterResult::Executed(result) => result,
        SideEffectEnterResult::NotExecuted => {
            // The closure runs here. It's non-deterministic by contract, in
            // the test it just swaps the name out.
            let _ = name;
            let outcome = vm
                .sys_side_effect_exit(
                    SideEffectExitResult::Success(Bytes::from_static(b"Francesco")),
                    &RetryPolicy::default(),
                )
                .unwrap();
            let_assert!(SideEffectExitOutcome::Committed(handle) = outcome);
            vm.notify_await_point(handle);
            match vm.take_async_result(handle) {
                Ok(Some(Value::Success(s))) => NonEmptyValue::Success(s),
                Ok(Some(Value::Failure(f))) => NonEmptyValue::Failure(f),
                Err(SuspendedOrVMError::Suspended(_)) => return,
                r => panic!("Unexpected side effect result {r:?}"),
            }
        }
    };

    match result {
        NonEmptyValue::Success(s) => {
            let greeted = String::from_utf8(s.to_vec()).unwrap();
            vm.sys_write_output(NonEmptyValue::Success(Bytes::from(format!(
                "Hello {greeted}"
            ))))
            .unwrap();
        }
        NonEmptyValue::Failure(f) => {
            vm.sys_write_output(NonEmptyValue::Failure(f)).unwrap();
        }
    }
    vm.sys_end().unwrap();
}

#[test]
fn side_effect_result_from_replayed_entry() {
    let mut output = VMTestCase::new()
        .input(start_message(2))
        .input(input_entry_message(b"Till"))
        .input(SideEffectEntryMessage {
            result: Some(side_effect_entry_message::Result::Value(
                Bytes::from_static(b"Francesco"),
            )),
        })
        .run(greet_side_effect_handler);

    assert_that!(
        output.next_decoded::<OutputEntryMessage>().unwrap(),
        is_output_with_success(b"Hello Francesco")
    );
    assert_eq!(
        output.next_decoded::<EndMessage>().unwrap(),
        EndMessage::default()
    );
    assert_eq!(output.next(), None);
}

#[test]
fn side_effect_completed_by_completion() {
    let mut output = VMTestCase::new()
        .input(start_message(1))
        .input(input_entry_message(b"Till"))
        .input(CompletionMessage {
            entry_index: 1,
            result: Some(completion_message::Result::Value(Bytes::from_static(
                b"Francesco",
            ))),
        })
        .run(greet_side_effect_handler);

    assert_eq!(
        output.next_decoded::<SideEffectEntryMessage>().unwrap(),
        SideEffectEntryMessage {
            result: Some(side_effect_entry_message::Result::Value(
                Bytes::from_static(b"Francesco")
            )),
        }
    );
    assert_that!(
        output.next_decoded::<OutputEntryMessage>().unwrap(),
        is_output_with_success(b"Hello Francesco")
    );
    assert_eq!(
        output.next_decoded::<EndMessage>().unwrap(),
        EndMessage::default()
    );
    assert_eq!(output.next(), None);
}

#[test]
fn side_effect_completed_by_ack() {
    let mut output = VMTestCase::new()
        .input(start_message(1))
        .input(input_entry_message(b"Till"))
        .run_without_closing_input(|vm, encoder| {
            vm.sys_input().unwrap();

            let_assert!(
                SideEffectEnterResult::NotExecuted = vm.sys_side_effect_enter().unwrap()
            );
            let outcome = vm
                .sys_side_effect_exit(
                    SideEffectExitResult::Success(Bytes::from_static(b"Francesco")),
                    &RetryPolicy::default(),
                )
                .unwrap();
            let_assert!(SideEffectExitOutcome::Committed(handle) = outcome);

            // Not acked yet
            vm.notify_await_point(handle);
            assert_that!(vm.take_async_result(handle), ok(none()));

            vm.notify_input(encoder.encode(&EntryAckMessage { entry_index: 1 }));

            let_assert!(Ok(Some(Value::Success(s))) = vm.take_async_result(handle));

            vm.sys_write_output(NonEmptyValue::Success(s)).unwrap();
            vm.sys_end().unwrap();
        });

    output.next_decoded::<SideEffectEntryMessage>().unwrap();
    assert_that!(
        output.next_decoded::<OutputEntryMessage>().unwrap(),
        is_output_with_success(b"Francesco")
    );
}

#[test]
fn request_response_mode_needs_no_ack() {
    let mut output = VMTestCase::with_vm_options(VMOptions {
        mode: ProtocolMode::RequestResponse,
    })
    .input(start_message(1))
    .input(input_entry_message(b"Till"))
    .run(greet_side_effect_handler);

    assert_eq!(
        output.next_decoded::<SideEffectEntryMessage>().unwrap(),
        SideEffectEntryMessage {
            result: Some(side_effect_entry_message::Result::Value(
                Bytes::from_static(b"Francesco")
            )),
        }
    );
    assert_that!(
        output.next_decoded::<OutputEntryMessage>().unwrap(),
        is_output_with_success(b"Hello Francesco")
    );
    assert_eq!(
        output.next_decoded::<EndMessage>().unwrap(),
        EndMessage::default()
    );
    assert_eq!(output.next(), None);
}

#[test]
fn replayed_terminal_failure_is_delivered() {
    let mut output = VMTestCase::new()
        .input(start_message(2))
        .input(input_entry_message(b"Till"))
        .input(SideEffectEntryMessage {
            result: Some(side_effect_entry_message::Result::Failure(Failure {
                code: 572,
                message: "You cannot do sideEffect state calls from within a side effect."
                    .to_owned(),
            })),
        })
        .run(greet_side_effect_handler);

    assert_that!(
        output.next_decoded::<OutputEntryMessage>().unwrap(),
        is_output_with_failure(
            572,
            "You cannot do sideEffect state calls from within a side effect."
        )
    );
    assert_eq!(
        output.next_decoded::<EndMessage>().unwrap(),
        EndMessage::default()
    );
    assert_eq!(output.next(), None);
}

#[test]
fn terminal_failure_is_journaled_and_surfaced() {
    let mut output = VMTestCase::new()
        .input(start_message(1))
        .input(input_entry_message(b"Till"))
        .input(EntryAckMessage { entry_index: 1 })
        .run(|vm| {
            vm.sys_input().unwrap();

            let_assert!(
                SideEffectEnterResult::NotExecuted = vm.sys_side_effect_enter().unwrap()
            );
            let outcome = vm
                .sys_side_effect_exit(
                    SideEffectExitResult::TerminalFailure(TerminalFailure {
                        code: 400,
                        message: "my-validation-failure".to_owned(),
                    }),
                    &RetryPolicy::default(),
                )
                .unwrap();
            let_assert!(SideEffectExitOutcome::Committed(handle) = outcome);

            vm.notify_await_point(handle);
            let_assert!(Ok(Some(Value::Failure(f))) = vm.take_async_result(handle));

            vm.sys_write_output(NonEmptyValue::Failure(f)).unwrap();
            vm.sys_end().unwrap();
        });

    assert_eq!(
        output.next_decoded::<SideEffectEntryMessage>().unwrap(),
        SideEffectEntryMessage {
            result: Some(side_effect_entry_message::Result::Failure(Failure {
                code: 400,
                message: "my-validation-failure".to_owned(),
            })),
        }
    );
    assert_that!(
        output.next_decoded::<OutputEntryMessage>().unwrap(),
        is_output_with_failure(400, "my-validation-failure")
    );
}

mod retries {
    use super::*;

    use test_log::test;

    fn fixed_policy() -> RetryPolicy {
        RetryPolicy::fixed_delay(Duration::from_millis(100), Some(3))
    }

    #[test]
    fn retryable_failure_schedules_a_journaled_sleep() {
        let mut output = VMTestCase::new()
            .input(start_message(1))
            .input(input_entry_message(b"Till"))
            .run_without_closing_input(|vm, encoder| {
                vm.sys_input().unwrap();

                // First attempt fails with a retryable error
                let_assert!(
                    SideEffectEnterResult::NotExecuted = vm.sys_side_effect_enter().unwrap()
                );
                let outcome = vm
                    .sys_side_effect_exit(
                        SideEffectExitResult::RetryableFailure(Error::internal("flaky downstream")),
                        &fixed_policy(),
                    )
                    .unwrap();
                let_assert!(SideEffectExitOutcome::ScheduleRetry(delay) = outcome);
                assert_eq!(delay, Duration::from_millis(100));

                // Nothing journaled for the attempt: the runner sleeps...
                let sleep_handle = vm.sys_sleep(Duration::from_millis(1714412829251)).unwrap();
                assert_eq!(u32::from(sleep_handle), 1);
                vm.notify_await_point(sleep_handle);
                vm.notify_input(encoder.encode(&CompletionMessage {
                    entry_index: 1,
                    result: Some(completion_message::Result::Empty(Empty::default())),
                }));
                let_assert!(Ok(Some(Value::Void)) = vm.take_async_result(sleep_handle));

                // ...and the second attempt succeeds
                let_assert!(
                    SideEffectEnterResult::NotExecuted = vm.sys_side_effect_enter().unwrap()
                );
                let outcome = vm
                    .sys_side_effect_exit(
                        SideEffectExitResult::Success(Bytes::from_static(b"Francesco")),
                        &fixed_policy(),
                    )
                    .unwrap();
                let_assert!(SideEffectExitOutcome::Committed(handle) = outcome);
                assert_eq!(u32::from(handle), 2);

                vm.notify_input(encoder.encode(&EntryAckMessage { entry_index: 2 }));
                vm.notify_await_point(handle);
                let_assert!(Ok(Some(Value::Success(s))) = vm.take_async_result(handle));

                vm.sys_write_output(NonEmptyValue::Success(s)).unwrap();
                vm.sys_end().unwrap();
            });

        // Only the backoff sleep sits between the attempts in the journal
        output.next_decoded::<SleepEntryMessage>().unwrap();
        assert_eq!(
            output.next_decoded::<SideEffectEntryMessage>().unwrap(),
            SideEffectEntryMessage {
                result: Some(side_effect_entry_message::Result::Value(
                    Bytes::from_static(b"Francesco")
                )),
            }
        );
        assert_that!(
            output.next_decoded::<OutputEntryMessage>().unwrap(),
            is_output_with_success(b"Francesco")
        );
        assert_eq!(
            output.next_decoded::<EndMessage>().unwrap(),
            EndMessage::default()
        );
        assert_eq!(output.next(), None);
    }

    #[test]
    fn exhausted_attempts_journal_the_terminal_failure() {
        let mut output = VMTestCase::new()
            .input(start_message(1))
            .input(input_entry_message(b"Till"))
            .input(EntryAckMessage { entry_index: 1 })
            .run(|vm| {
                vm.sys_input().unwrap();

                let_assert!(
                    SideEffectEnterResult::NotExecuted = vm.sys_side_effect_enter().unwrap()
                );
                // max_attempts = 1: the first failure is already terminal
                let outcome = vm
                    .sys_side_effect_exit(
                        SideEffectExitResult::RetryableFailure(Error::internal("flaky downstream")),
                        &RetryPolicy::fixed_delay(Duration::from_millis(100), Some(1)),
                    )
                    .unwrap();
                let_assert!(SideEffectExitOutcome::Committed(handle) = outcome);

                vm.notify_await_point(handle);
                let_assert!(Ok(Some(Value::Failure(f))) = vm.take_async_result(handle));
                assert_eq!(f.code, 500);

                vm.sys_write_output(NonEmptyValue::Failure(f)).unwrap();
                vm.sys_end().unwrap();
            });

        assert_eq!(
            output.next_decoded::<SideEffectEntryMessage>().unwrap(),
            SideEffectEntryMessage {
                result: Some(side_effect_entry_message::Result::Failure(Failure {
                    code: 500,
                    message: "flaky downstream".to_owned(),
                })),
            }
        );
        assert_that!(
            output.next_decoded::<OutputEntryMessage>().unwrap(),
            is_output_with_failure(500, "flaky downstream")
        );
    }

    #[test]
    fn replay_of_a_retry_backoff() {
        // Journal recorded by the previous attempt: a failed try, its backoff
        // sleep, then the committed result. The closure runs again for the
        // replayed failed try, its sleep replay-matches, and the commit is
        // delivered from the journal without a third execution.
        let mut executions = 0;
        let mut output = VMTestCase::new()
            .input(start_message(3))
            .input(input_entry_message(b"Till"))
            .input(SleepEntryMessage {
                wake_up_time: 1714412829251,
                result: Some(crate::service_protocol::messages::sleep_entry_message::Result::Empty(
                    Empty::default(),
                )),
            })
            .input(SideEffectEntryMessage {
                result: Some(side_effect_entry_message::Result::Value(
                    Bytes::from_static(b"Francesco"),
                )),
            })
            .run(|vm| {
                vm.sys_input().unwrap();

                let result = loop {
                    match vm.sys_side_effect_enter().unwrap() {
                        SideEffectEnterResult::Executed(result) => break result,
                        SideEffectEnterResult::NotExecuted => {}
                    }
                    executions += 1;
                    let outcome = vm
                        .sys_side_effect_exit(
                            SideEffectExitResult::RetryableFailure(Error::internal(
                                "flaky downstream",
                            )),
                            &fixed_policy(),
                        )
                        .unwrap();
                    let_assert!(SideEffectExitOutcome::ScheduleRetry(_) = outcome);

                    let sleep_handle =
                        vm.sys_sleep(Duration::from_millis(1714412829251)).unwrap();
                    vm.notify_await_point(sleep_handle);
                    let_assert!(Ok(Some(Value::Void)) = vm.take_async_result(sleep_handle));
                };

                let_assert!(NonEmptyValue::Success(s) = result);
                vm.sys_write_output(NonEmptyValue::Success(s)).unwrap();
                vm.sys_end().unwrap();
            });

        assert_eq!(executions, 1);
        assert_that!(
            output.next_decoded::<OutputEntryMessage>().unwrap(),
            is_output_with_success(b"Francesco")
        );
        assert_eq!(
            output.next_decoded::<EndMessage>().unwrap(),
            EndMessage::default()
        );
        assert_eq!(output.next(), None);
    }
}

mod forbidden_ops {
    use super::*;

    use test_log::test;

    #[test]
    fn get_state_inside_side_effect() {
        let mut output = VMTestCase::new()
            .input(start_message(1))
            .input(input_entry_message(b"Till"))
            .run(|vm| {
                vm.sys_input().unwrap();

                let_assert!(
                    SideEffectEnterResult::NotExecuted = vm.sys_side_effect_enter().unwrap()
                );

                let err = vm.sys_state_get("STATE".to_owned()).unwrap_err();
                assert_eq!(
                    err.message(),
                    "You cannot do get state calls from within a side effect."
                );
                assert_eq!(err.code(), error::codes::SIDE_EFFECT_VIOLATION.code());
            });

        // The violation is recorded on the side effect entry, then the
        // invocation dies with the same terminal failure.
        assert_eq!(
            output.next_decoded::<SideEffectEntryMessage>().unwrap(),
            SideEffectEntryMessage {
                result: Some(side_effect_entry_message::Result::Failure(Failure {
                    code: 572,
                    message: "You cannot do get state calls from within a side effect."
                        .to_owned(),
                })),
            }
        );
        assert_output_failure_and_end(
            &mut output,
            572,
            "You cannot do get state calls from within a side effect.",
        );
    }

    #[test]
    fn nested_side_effect() {
        let mut output = VMTestCase::new()
            .input(start_message(1))
            .input(input_entry_message(b"Till"))
            .run(|vm| {
                vm.sys_input().unwrap();

                let_assert!(
                    SideEffectEnterResult::NotExecuted = vm.sys_side_effect_enter().unwrap()
                );

                let err = vm.sys_side_effect_enter().unwrap_err();
                assert_eq!(
                    err.message(),
                    "You cannot do sideEffect state calls from within a side effect."
                );
            });

        output.next_decoded::<SideEffectEntryMessage>().unwrap();
        assert_output_failure_and_end(
            &mut output,
            572,
            "You cannot do sideEffect state calls from within a side effect.",
        );
    }

    #[test]
    fn each_op_has_its_own_fixed_message() {
        let cases: Vec<(&str, fn(&mut CoreVM) -> Error)> = vec![
            ("set state", |vm| {
                vm.sys_state_set("k".to_owned(), Bytes::new()).unwrap_err()
            }),
            ("clear state", |vm| {
                vm.sys_state_clear("k".to_owned()).unwrap_err()
            }),
            ("clear all state", |vm| vm.sys_state_clear_all().unwrap_err()),
            ("get state keys", |vm| vm.sys_state_get_keys().unwrap_err()),
            ("sleep", |vm| {
                vm.sys_sleep(Duration::from_millis(100)).unwrap_err()
            }),
            ("invoke", |vm| {
                vm.sys_invoke(
                    Target {
                        service: "Greeter".to_owned(),
                        handler: "greet".to_owned(),
                        key: None,
                    },
                    Bytes::new(),
                )
                .unwrap_err()
            }),
            ("background invoke", |vm| {
                vm.sys_background_invoke(
                    Target {
                        service: "Greeter".to_owned(),
                        handler: "greet".to_owned(),
                        key: None,
                    },
                    Bytes::new(),
                    None,
                )
                .unwrap_err()
            }),
            ("awakeable", |vm| vm.sys_awakeable().unwrap_err()),
            ("resolve awakeable", |vm| {
                vm.sys_resolve_awakeable("id".to_owned(), Bytes::new())
                    .unwrap_err()
            }),
            ("reject awakeable", |vm| {
                vm.sys_reject_awakeable(
                    "id".to_owned(),
                    TerminalFailure {
                        code: 500,
                        message: "nope".to_owned(),
                    },
                )
                .unwrap_err()
            }),
        ];

        for (op, trigger) in cases {
            VMTestCase::new()
                .input(start_message(1))
                .input(input_entry_message(b"Till"))
                .run(|vm| {
                    vm.sys_input().unwrap();
                    let_assert!(
                        SideEffectEnterResult::NotExecuted = vm.sys_side_effect_enter().unwrap()
                    );

                    let err = trigger(vm);
                    assert_eq!(
                        err.message(),
                        format!("You cannot do {op} calls from within a side effect."),
                        "wrong message for op {op}"
                    );
                });
        }
    }
}

#[test]
fn two_side_effects_in_execution_order() {
    let mut output = VMTestCase::new()
        .input(start_message(1))
        .input(input_entry_message(b"Till"))
        .run_without_closing_input(|vm, encoder| {
            vm.sys_input().unwrap();

            // First side effect commits before the second one runs
            let_assert!(SideEffectEnterResult::NotExecuted = vm.sys_side_effect_enter().unwrap());
            let_assert!(
                Ok(SideEffectExitOutcome::Committed(h1)) = vm.sys_side_effect_exit(
                    SideEffectExitResult::Success(Bytes::from_static(b"first")),
                    &RetryPolicy::default(),
                )
            );

            let_assert!(SideEffectEnterResult::NotExecuted = vm.sys_side_effect_enter().unwrap());
            let_assert!(
                Ok(SideEffectExitOutcome::Committed(h2)) = vm.sys_side_effect_exit(
                    SideEffectExitResult::Success(Bytes::from_static(b"second")),
                    &RetryPolicy::default(),
                )
            );

            assert_eq!(u32::from(h1), 1);
            assert_eq!(u32::from(h2), 2);

            vm.notify_input(encoder.encode(&EntryAckMessage { entry_index: 1 }));
            vm.notify_input(encoder.encode(&EntryAckMessage { entry_index: 2 }));

            // Awaited in reverse order, the results are already there
            vm.notify_await_point(h2);
            let_assert!(Ok(Some(Value::Success(_))) = vm.take_async_result(h2));
            vm.notify_await_point(h1);
            let_assert!(Ok(Some(Value::Success(first))) = vm.take_async_result(h1));

            vm.sys_write_output(NonEmptyValue::Success(first)).unwrap();
            vm.sys_end().unwrap();
        });

    assert_eq!(
        output.next_decoded::<SideEffectEntryMessage>().unwrap(),
        SideEffectEntryMessage {
            result: Some(side_effect_entry_message::Result::Value(
                Bytes::from_static(b"first")
            )),
        }
    );
    assert_eq!(
        output.next_decoded::<SideEffectEntryMessage>().unwrap(),
        SideEffectEntryMessage {
            result: Some(side_effect_entry_message::Result::Value(
                Bytes::from_static(b"second")
            )),
        }
    );
    assert_that!(
        output.next_decoded::<OutputEntryMessage>().unwrap(),
        is_output_with_success(b"first")
    );
    assert_eq!(
        output.next_decoded::<EndMessage>().unwrap(),
        EndMessage::default()
    );
    assert_eq!(output.next(), None);
}
