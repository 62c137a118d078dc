mod support;

use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use subspace_client::tx::history_dir;
use subspace_client::{CallArg, ClientError, HistoryKind, ModuleUpdate, Signer, TxOptions, TxStatus};
use support::{address, harness, keypair, NETWORK, TOKEN};

#[test]
fn transfer_walks_pending_to_complete() {
    let h = harness();
    let signer = keypair(1);
    let cache = h.client.cache().clone();
    let pending_dir = history_dir(NETWORK, &signer.address(), HistoryKind::Pending);
    let seen_pending = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&seen_pending);
    h.chain.on_submit(move |_| {
        seen.store(cache.list(&pending_dir).unwrap().len(), Ordering::SeqCst);
    });

    let result = h
        .client
        .transfer(&address(2), 5.0, &signer, &TxOptions::default())
        .unwrap();
    assert!(result.success, "{}", result.message);
    assert!(result.tx_hash.is_some());
    assert_eq!(seen_pending.load(Ordering::SeqCst), 1);

    let composer = h.client.composer();
    assert!(composer
        .history(None, &signer.address(), HistoryKind::Pending)
        .unwrap()
        .is_empty());
    let complete = composer
        .history(None, &signer.address(), HistoryKind::Complete)
        .unwrap();
    assert_eq!(complete.len(), 1);
    assert_eq!(complete[0].status, TxStatus::CompletedSuccess);
    assert_eq!(complete[0].id, result.record_id);
    assert_eq!(complete[0].call["call_args"]["value"], 5 * TOKEN);
    assert_eq!(complete[0].call["call_args"]["dest"], address(2));

    let submitted = h.chain.submitted();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].call["call_args"]["value"], 5 * TOKEN);
    assert_eq!(submitted[0].signer, signer.address());
}

#[test]
fn transfer_to_module_name_resolves_key() {
    let h = harness();
    let result = h
        .client
        .transfer("alice-mod", 1.5, &keypair(1), &TxOptions::default())
        .unwrap();
    assert!(result.success);
    let submitted = h.chain.submitted();
    assert_eq!(submitted[0].call["call_args"]["dest"], address(10));
    assert_eq!(submitted[0].call["call_args"]["value"], 1_500_000_000u64);
}

#[test]
fn invalid_destination_fails_before_any_record() {
    let h = harness();
    let signer = keypair(1);
    let err = h
        .client
        .transfer("nobody", 1.0, &signer, &TxOptions::default())
        .unwrap_err();
    assert!(matches!(err, ClientError::UnknownAddress(_)));
    for kind in [HistoryKind::Pending, HistoryKind::Complete] {
        assert!(h.client.composer().history(None, &signer.address(), kind).unwrap().is_empty());
    }
    assert!(h.chain.submitted().is_empty());
}

#[test]
fn chain_rejection_is_a_failed_result() {
    let h = harness();
    let signer = keypair(1);
    h.chain.reject_next_submission("InsufficientBalance");
    let result = h
        .client
        .transfer(&address(2), 1.0, &signer, &TxOptions::default())
        .unwrap();
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("InsufficientBalance"));
    let complete = h
        .client
        .composer()
        .history(None, &signer.address(), HistoryKind::Complete)
        .unwrap();
    assert_eq!(complete[0].status, TxStatus::CompletedFailure);
}

#[test]
fn rejection_without_finalization_counts_as_accepted() {
    let h = harness();
    h.chain.reject_next_submission("late failure");
    let result = h
        .client
        .transfer(&address(2), 1.0, &keypair(1), &TxOptions::default().no_wait())
        .unwrap();
    assert!(result.success);
}

#[test]
fn submission_error_is_reported_not_raised() {
    let h = harness();
    let signer = keypair(1);
    h.chain.fail_next_submissions(1);
    let result = h
        .client
        .transfer(&address(2), 1.0, &signer, &TxOptions::default())
        .unwrap();
    assert!(!result.success);
    assert!(result.error.unwrap().contains("injected submission failure"));
    assert!(result.tx_hash.is_none());
    let complete = h
        .client
        .composer()
        .history(None, &signer.address(), HistoryKind::Complete)
        .unwrap();
    assert_eq!(complete.len(), 1);
    assert_eq!(complete[0].status, TxStatus::CompletedFailure);
}

#[test]
fn concurrent_calls_from_one_signer_get_distinct_records() {
    let h = harness();
    let signer = keypair(1);
    std::thread::scope(|s| {
        for i in 0..4 {
            let client = &h.client;
            let signer = &signer;
            s.spawn(move || {
                let opts = TxOptions {
                    nonce: Some(i),
                    ..TxOptions::default()
                };
                client.transfer(&address(2), 1.0, signer, &opts).unwrap()
            });
        }
    });
    let complete = h
        .client
        .composer()
        .history(None, &signer.address(), HistoryKind::Complete)
        .unwrap();
    assert_eq!(complete.len(), 4);
    assert!(complete.windows(2).all(|w| w[0].start_time > w[1].start_time));
}

#[test]
fn register_defaults_to_min_stake_plus_one_token() {
    let h = harness();
    let signer = keypair(5);
    let result = h
        .client
        .register("dave-mod", "10.0.0.9:8000", "alpha", None, None, &signer, &TxOptions::default())
        .unwrap();
    assert!(result.success);
    let call = &h.chain.submitted()[0].call;
    assert_eq!(call["call_function"], "register");
    assert_eq!(call["call_args"]["stake"], 4 * TOKEN);
    assert_eq!(call["call_args"]["module_key"], signer.address());
    assert_eq!(call["call_args"]["network"], "alpha");
}

#[test]
fn stake_calls_target_resolved_modules() {
    let h = harness();
    let signer = keypair(9);
    let opts = TxOptions::default();
    assert!(h.client.add_stake("alice-mod", 2.0, 0, &signer, &opts).unwrap().success);
    assert!(h.client.remove_stake("bob-mod", 0.5, 0, &signer, &opts).unwrap().success);
    assert!(h
        .client
        .transfer_stake("alice-mod", "bob-mod", 1.0, 0, &signer, &opts)
        .unwrap()
        .success);
    let submitted = h.chain.submitted();
    assert_eq!(submitted[0].call["call_args"]["module_key"], address(10));
    assert_eq!(submitted[0].call["call_args"]["amount"], 2 * TOKEN);
    assert_eq!(submitted[1].call["call_args"]["amount"], TOKEN / 2);
    assert_eq!(submitted[2].call["call_args"]["new_module_key"], address(11));
    assert_eq!(submitted[2].nonce, 2);
}

#[test]
fn update_module_keeps_unset_fields() {
    let h = harness();
    let signer = keypair(10);
    let update = ModuleUpdate {
        delegation_fee: Some(12),
        ..ModuleUpdate::default()
    };
    assert!(h
        .client
        .update_module("alice-mod", update, 0, &signer, &TxOptions::default())
        .unwrap()
        .success);
    let args = &h.chain.submitted()[0].call["call_args"];
    assert_eq!(args["name"], "alice-mod");
    assert_eq!(args["address"], "10.0.0.0:8000");
    assert_eq!(args["delegation_fee"], 12);

    let too_high = ModuleUpdate {
        delegation_fee: Some(101),
        ..ModuleUpdate::default()
    };
    let err = h
        .client
        .update_module("alice-mod", too_high, 0, &signer, &TxOptions::default())
        .unwrap_err();
    assert!(err.is_validation());
}

#[test]
fn set_weights_normalises_and_caps() {
    let h = harness();
    let result = h
        .client
        .set_weights(&[0, 1, 2], &[1.0, 3.0, 0.5], 0, &keypair(10), &TxOptions::default())
        .unwrap();
    assert!(result.success);
    let args = &h.chain.submitted()[0].call["call_args"];
    assert_eq!(args["uids"], json!([0, 1]));
    assert_eq!(args["weights"], json!([16_383, 49_151]));
}

#[test]
fn privileged_calls_are_wrapped() {
    let h = harness();
    let signer = keypair(1);
    let updates = [("burn_rate", CallArg::Int(25))];
    assert!(h
        .client
        .update_global(&updates, &signer, &TxOptions::default())
        .unwrap()
        .success);
    let call = &h.chain.submitted()[0].call;
    assert_eq!(call["call_module"], "Sudo");
    assert_eq!(call["call_function"], "sudo");
    let inner = &call["call_args"]["call"];
    assert_eq!(inner["call_function"], "update_global");
    assert_eq!(inner["call_args"]["burn_rate"], 25);
    assert_eq!(inner["call_args"]["max_name_length"], 32);

    let bad = [("not_a_param", CallArg::Int(1))];
    assert!(h.client.update_global(&bad, &signer, &TxOptions::default()).is_err());

    assert!(h
        .client
        .set_code(&[0, 97, 115, 109], &signer, &TxOptions::default())
        .unwrap()
        .success);
    let call = &h.chain.submitted()[1].call;
    assert_eq!(call["call_function"], "sudo_unchecked_weight");
    assert_eq!(call["call_args"]["weight"], json!([0, 0]));
    assert_eq!(call["call_args"]["call"]["call_function"], "sudo");
    assert_eq!(
        call["call_args"]["call"]["call_args"]["call"]["call_args"]["code"],
        "0x0061736d"
    );
}
