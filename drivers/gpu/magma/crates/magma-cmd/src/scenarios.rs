//! End-to-end submission scenarios against loopback firmware.

use magma_core::{Error, Priority, SlotId};
use magma_rpc::opcode;

use crate::testutil::Harness;
use crate::{RequestFlags, SlotWaiter, StallReason, SubmissionConfig, SubmitClass};

#[test]
fn test_takeover_parks_submissions_until_deregister() {
    let h = Harness::single_pool(1);
    let old = h.context();
    let first = h.submit(old);
    h.dev.run_pending();
    h.complete(&first);
    h.dev.run_pending();

    // Disable the idle context so its slot can be stolen outside the drain.
    h.dev.unpin_context(old).unwrap();
    h.dev.run_pending();
    assert!(!h.ctx(old).is_enabled());
    assert!(h.dev.is_steal_candidate(old));

    h.fw.set_auto_ack(false);
    let new = h.context();
    let parked = [h.submit(new), h.submit(new), h.submit(new)];
    let slot = SlotId::new(0);

    assert_eq!(h.ctx(new).slot(), slot);
    assert_eq!(h.dev.slot_holder(slot), Some(new));
    assert_eq!(h.dev.slot_owner(slot), Some(old));
    assert_eq!(h.ctx(new).parked_requests().len(), 3);
    assert_eq!(h.fw.count(opcode::DEREGISTER_CONTEXT), 1);
    assert!(parked.iter().all(|r| r.test(RequestFlags::PARKED)));
    assert!(!h.ctx(old).slot().is_valid());
    h.dev.check_slot_ownership().unwrap();

    h.fw.release_replies();
    h.dev.run_pending();
    assert_eq!(h.dev.slot_owner(slot), Some(new));
    assert!(h.ctx(new).is_registered());
    assert!(h.ctx(new).parked_requests().is_empty());
    let active: Vec<_> = h.ctx(new).active_requests().iter().map(|r| r.seqno()).collect();
    let expected: Vec<_> = parked.iter().map(|r| r.seqno()).collect();
    assert_eq!(active, expected);
    assert_eq!(h.ctx(new).ring_tail(), parked[2].tail());

    h.fw.release_replies();
    h.dev.run_pending();
    assert_eq!(h.dev.outstanding(), 0);
}

#[test]
fn test_exhausted_pool_defers_then_steals_enabled() {
    let h = Harness::single_pool(2);
    let a = h.context();
    let b = h.context();
    let hog_a = h.submit(a);
    let _hog_b = h.submit(b);
    h.dev.run_pending();

    let c = h.context();
    let late = h.submit(c);
    assert!(!late.is_pinned());
    assert_eq!(h.platform.sleeps(), vec![1000, 2000]);
    h.dev.run_pending();
    assert_eq!(
        h.dev.stall(SubmitClass::Single),
        StallReason::FreeSlots(SlotWaiter::Background)
    );

    h.complete(&hog_a);
    h.dev.run_pending();
    assert!(late.test(RequestFlags::SUBMITTED));
    assert_eq!(h.ctx(c).slot(), SlotId::new(0));
    assert!(!h.ctx(a).slot().is_valid());
    assert!(!h.ctx(a).is_registered());
    assert_eq!(h.dev.allocator_stats().steals_enabled, 1);
    assert_eq!(h.dev.stall(SubmitClass::Single), StallReason::None);
    assert!(!h.dev.engine(SubmitClass::Single).is_blocked());
    assert_eq!(h.dev.outstanding(), 0);
    h.dev.check_slot_ownership().unwrap();

    // The victim gets a slot back once one frees up.
    let again = h.submit(a);
    h.complete(&late);
    h.dev.run_pending();
    assert!(again.test(RequestFlags::SUBMITTED));
    h.dev.check_slot_ownership().unwrap();
}

#[test]
fn test_ownership_holds_through_churn() {
    let h = Harness::single_pool(2);
    let contexts: Vec<_> = (0..5).map(|_| h.context()).collect();

    for round in 0..2 {
        for &ctx in &contexts {
            let req = h.submit(ctx);
            h.dev.run_pending();
            assert!(req.test(RequestFlags::SUBMITTED), "round {} context {}", round, ctx);
            h.complete(&req);
            h.dev.run_pending();
            h.dev.check_slot_ownership().unwrap();
            assert!(h.dev.registered_descriptors() <= 2);
        }
    }
    assert_eq!(h.dev.outstanding(), 0);
    assert!(h.dev.allocator_stats().steals_enabled > 0);
}

#[test]
fn test_ban_cancels_inflight_work() {
    let h = Harness::single_pool(2);
    let ctx = h.context();
    let a = h.submit(ctx);
    let b = h.submit(ctx);
    h.dev.run_pending();

    h.dev.ban_context(ctx).unwrap();
    assert_eq!(h.fw.count(opcode::SET_CONTEXT_PREEMPTION_TIMEOUT), 1);
    assert!(!a.is_cancelled());
    h.dev.run_pending();

    assert!(a.is_cancelled() && b.is_cancelled());
    assert!(a.test(RequestFlags::RETIRED));
    assert_eq!(h.ctx(ctx).slot_refs(), 0);
    assert!(h.ctx(ctx).is_banned());
    assert_eq!(
        h.dev.create_request(ctx, Priority::NORMAL, 0).err(),
        Some(Error::Banned)
    );

    // Banning again is a no-op and the flag survives a reset.
    h.dev.ban_context(ctx).unwrap();
    h.dev.reset_prepare();
    h.dev.reset(false);
    h.dev.reset_finish();
    assert!(h.ctx(ctx).is_banned());
    assert_eq!(h.dev.outstanding(), 0);
}

#[test]
fn test_hung_drain_cancels_everything() {
    let h = Harness::single_pool(1);
    let a = h.context();
    let b = h.context();
    let hog = h.submit(a);
    let starved = h.submit(b);
    h.dev.run_pending();
    assert!(h.dev.engine(SubmitClass::Single).is_blocked());
    assert!(!h.dev.check_drain_hang());

    h.platform
        .advance_ns(h.dev.config().drain_hang_timeout_ns + 1);
    assert!(h.dev.check_drain_hang());
    assert!(h.dev.is_submission_disabled());
    assert!(starved.is_cancelled());
    assert!(hog.is_cancelled());
    assert!(!h.dev.engine(SubmitClass::Single).is_blocked());
    assert_eq!(h.dev.queued(SubmitClass::Single), 0);
}

#[test]
fn test_parent_registers_children_together() {
    let h = Harness::with_config(SubmissionConfig {
        num_slots: 8,
        multi_reserved: 4,
        ..SubmissionConfig::default()
    });
    let parent = h.dev.create_context(Harness::parent_desc(2)).unwrap();
    assert_eq!(h.ctx(parent).slot_width(), 4);
    assert_eq!(h.ctx(parent).submit_class(), SubmitClass::Multi);

    let req = h.submit(parent);
    assert!(req.test(RequestFlags::SUBMITTED));
    let sent = h.fw.sent();
    let reg = sent
        .iter()
        .find(|a| a.opcode() == opcode::REGISTER_CONTEXT_MULTI)
        .unwrap();
    assert_eq!(reg.slot(), SlotId::new(0));
    assert_eq!(h.fw.count(opcode::REGISTER_CONTEXT), 0);
    assert_eq!(h.dev.engine_stats(SubmitClass::Multi).bypassed, 1);
    assert_eq!(h.dev.engine_stats(SubmitClass::Single).bypassed, 0);
    assert_eq!(h.dev.slot_holder(SlotId::new(3)), Some(parent));
    assert_eq!(h.dev.slot_holder(SlotId::new(4)), None);
}

#[test]
fn test_reset_releases_destroyed_slots() {
    let h = Harness::single_pool(2);
    let ctx = h.context();
    let req = h.submit(ctx);
    h.complete(&req);
    h.dev.run_pending();

    h.fw.set_auto_ack(false);
    h.dev.destroy_context(ctx).unwrap();
    assert_eq!(h.dev.slot_holder(SlotId::new(0)), Some(ctx));
    assert_eq!(h.dev.outstanding(), 1);

    h.dev.reset_prepare();
    assert_eq!(h.dev.slot_holder(SlotId::new(0)), None);
    assert_eq!(h.dev.outstanding(), 0);
    h.fw.discard_replies();
    h.dev.reset(false);
    h.dev.reset_finish();

    let next = h.context();
    let req = h.submit(next);
    assert!(req.test(RequestFlags::SUBMITTED));
    assert_eq!(h.ctx(next).slot(), SlotId::new(0));
    assert_eq!(h.dev.allocator_stats().allocated, 2);
    h.dev.check_slot_ownership().unwrap();
}

#[test]
fn test_detach_fails_outstanding_work() {
    let h = Harness::single_pool(2);
    let ctx = h.context();
    let req = h.submit(ctx);
    let unsent = h.create(ctx);

    h.dev.detach();
    assert!(req.is_cancelled());
    assert!(h.dev.context(ctx).is_none());
    assert_eq!(h.dev.registered_descriptors(), 0);
    assert_eq!(h.dev.outstanding(), 0);
    assert_eq!(h.dev.submit_request(&unsent), Err(Error::NotFound));
    assert!(unsent.is_cancelled());
}
