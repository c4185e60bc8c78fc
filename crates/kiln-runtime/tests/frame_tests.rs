//! Call frame and multiple-values tests

mod common;

use common::{setup, small_config};
use kiln_config::RuntimeConfig;
use kiln_runtime::{
    FrameBase, FrameDispatcher, FrameError, FrameState, NativeFunction, RuntimeError, Value,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

// ===== Scenarios =====

#[test]
fn test_three_argument_frame_reads_back() {
    let (_rt, mut ctx, _) = setup(RuntimeConfig::default());
    assert_eq!(ctx.small_call_threshold(), 64);
    let top = ctx.stack_top();

    let frame = ctx
        .open_frame_with(&[Value::Fixnum(1), Value::Fixnum(2), Value::Fixnum(3)])
        .unwrap();
    assert_eq!(
        ctx.args(frame).unwrap(),
        vec![Value::Fixnum(1), Value::Fixnum(2), Value::Fixnum(3)]
    );
    ctx.close_frame(frame);
    assert_eq!(ctx.stack_top(), top);
}

#[test]
fn test_frame_states() {
    let (_rt, mut ctx, _) = setup(small_config());
    let frame = ctx.open_frame(2).unwrap();
    assert_eq!(ctx.frame_state(frame), FrameState::Open);
    ctx.activate(frame).unwrap();
    assert_eq!(ctx.frame_state(frame), FrameState::Active);
    ctx.close_frame(frame);
    assert_eq!(ctx.frame_state(frame), FrameState::Closed);
    assert_eq!(
        ctx.activate(frame),
        Err(FrameError::Closed {
            serial: frame.serial()
        })
    );
}

#[test]
fn test_threshold_boundary() {
    let (_rt, mut ctx, _) = setup(small_config());
    let below = ctx.open_frame(7).unwrap();
    assert_eq!(below.base(), FrameBase::Values);
    ctx.close_frame(below);

    let at = ctx.open_frame(8).unwrap();
    assert_eq!(at.base(), FrameBase::Stack { offset: 0 });
    ctx.close_frame(at);
}

#[test]
fn test_oversized_call_rejected_before_any_work() {
    let (_rt, mut ctx, _) = setup(small_config());
    let callee = NativeFunction::new("list", 0, None, |_, _| panic!("must not run"));
    let args = vec![Value::Nil; 4097];
    let before = ctx.counters();

    let err = FrameDispatcher::funcall(&mut ctx, &callee, &args).unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Frame(FrameError::TooManyArguments {
            argc: 4097,
            limit: 4096
        })
    ));
    assert_eq!(ctx.counters(), before);
    assert_eq!(ctx.stack_top(), 0);
}

// ===== Multiple values =====

fn floor_div() -> NativeFunction {
    NativeFunction::fixed("floor", 2, |ctx, frame| {
        let (Value::Fixnum(n), Value::Fixnum(d)) = (ctx.arg(frame, 0)?, ctx.arg(frame, 1)?) else {
            return Err(RuntimeError::TypeError {
                expected: "fixnum",
                got: "non-fixnum",
            });
        };
        Ok(ctx.set_values(&[Value::Fixnum(n.div_euclid(d)), Value::Fixnum(n.rem_euclid(d))])?)
    })
}

#[test]
fn test_multiple_values_return() {
    let (_rt, mut ctx, _) = setup(small_config());
    let count = ctx
        .funcall(&floor_div(), &[Value::Fixnum(7), Value::Fixnum(2)])
        .unwrap();
    assert_eq!(count, 2);
    assert_eq!(ctx.primary_value(), Value::Fixnum(3));
    assert_eq!(ctx.value(1), Value::Fixnum(1));
    assert_eq!(ctx.value(2), Value::NoValue);
}

#[test]
fn test_zero_values_primary_is_nil() {
    let (_rt, mut ctx, _) = setup(small_config());
    let values = NativeFunction::new("values", 0, None, |ctx, frame| {
        let args = ctx.args(frame)?;
        Ok(ctx.set_values(&args)?)
    });
    assert_eq!(ctx.funcall(&values, &[]).unwrap(), 0);
    assert_eq!(ctx.primary_value(), Value::Nil);
    assert_eq!(ctx.value(0), Value::NoValue);
}

#[test]
fn test_too_many_values() {
    let (_rt, mut ctx, _) = setup(small_config());
    let values = NativeFunction::new("values", 0, None, |ctx, frame| {
        let args = ctx.args(frame)?;
        Ok(ctx.set_values(&args)?)
    });
    let err = ctx.funcall(&values, &vec![Value::Nil; 17]).unwrap_err();
    assert_eq!(err.to_string(), "Cannot return 17 values; the limit is 16");
    assert_eq!(ctx.frame_depth(), 0);
}

#[test]
fn test_nested_calls_through_dispatcher() {
    let (_rt, mut ctx, _) = setup(small_config());
    let outer = NativeFunction::fixed("outer", 1, |ctx, frame| {
        let arg = ctx.arg(frame, 0)?;
        let depth = ctx.frame_depth();
        let inner = NativeFunction::fixed("inner", 0, move |ctx, _| {
            Ok(ctx.set_value(Value::Fixnum(depth as i64)))
        });
        ctx.funcall(&inner, &[])?;
        let inner_depth = ctx.primary_value();
        // The outer frame's arguments were in the values buffer.
        assert!(matches!(ctx.arg(frame, 0), Err(FrameError::Stale { .. })));
        Ok(ctx.set_values(&[arg, inner_depth])?)
    });
    assert_eq!(ctx.funcall(&outer, &[Value::Character('k')]).unwrap(), 2);
    assert_eq!(ctx.values(), &[Value::Character('k'), Value::Fixnum(1)]);
}

// ===== Properties =====

proptest! {
    #[test]
    fn prop_small_frames_never_touch_stack(argc in 0usize..8) {
        let (_rt, mut ctx, _) = setup(small_config());
        let before = ctx.counters();
        let frame = ctx.open_frame(argc).unwrap();
        ctx.close_frame(frame);
        let after = ctx.counters();
        prop_assert_eq!(after.stack_reservations, before.stack_reservations);
        prop_assert_eq!(after.stack_releases, before.stack_releases);
        prop_assert_eq!(after.buffer_frames, before.buffer_frames + 1);
        prop_assert_eq!(ctx.stack_top(), 0);
    }

    #[test]
    fn prop_stack_frames_restore_high_water(
        prefix in 8usize..200,
        argc in 8usize..2000,
    ) {
        let (_rt, mut ctx, _) = setup(small_config());
        let outer = ctx.open_frame(prefix).unwrap();
        let top = ctx.stack_top();
        let frame = ctx.open_frame(argc).unwrap();
        prop_assert!(ctx.stack_top() > top);
        prop_assert_eq!(ctx.stack_top(), top + argc);
        ctx.close_frame(frame);
        prop_assert_eq!(ctx.stack_top(), top);
        ctx.close_frame(outer);
        prop_assert_eq!(ctx.stack_top(), 0);
    }

    #[test]
    fn prop_arguments_read_back(values in prop::collection::vec(any::<i32>(), 0..64)) {
        let (_rt, mut ctx, _) = setup(small_config());
        let args: Vec<Value> = values.iter().map(|n| Value::Fixnum(*n as i64)).collect();
        let frame = ctx.open_frame_with(&args).unwrap();
        for (i, expected) in args.iter().enumerate() {
            prop_assert_eq!(ctx.arg(frame, i).unwrap(), *expected);
        }
        ctx.close_frame(frame);
    }
}
