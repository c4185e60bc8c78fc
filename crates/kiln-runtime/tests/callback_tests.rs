//! Native → hosted callback round trips through trampolines

mod common;

use common::{describe, setup, small_config};
use kiln_runtime::{
    Callee, Collector, ForeignFunction, ForeignSignature, ForeignType, NativeFunction,
    RuntimeError, RuntimeEvent, Trampoline, Value,
};
use pretty_assertions::assert_eq;
use rstest::rstest;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy)]
enum Sample {
    Plain(Value),
    Integer(i128),
    Text(&'static str),
}

impl Sample {
    fn build(self, heap: &dyn Collector) -> Value {
        match self {
            Sample::Plain(value) => value,
            Sample::Integer(n) => Value::integer(n, heap).unwrap(),
            Sample::Text(s) => Value::Object(heap.make_string(s).unwrap()),
        }
    }
}

/// Callee returning its argument, remembering what it was given
fn identity(seen: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Callee> {
    let seen = Arc::clone(seen);
    Arc::new(NativeFunction::fixed("identity", 1, move |ctx, frame| {
        let value = ctx.arg(frame, 0)?;
        let text = describe(ctx.runtime().heap().as_ref(), &value);
        seen.lock().unwrap().push(text);
        Ok(ctx.set_value(value))
    }))
}

#[rstest]
#[case(ForeignType::Char, Sample::Plain(Value::Character('A')))]
#[case(ForeignType::UnsignedChar, Sample::Plain(Value::Character('é')))]
#[case(ForeignType::Byte, Sample::Integer(-100))]
#[case(ForeignType::UnsignedByte, Sample::Integer(200))]
#[case(ForeignType::Short, Sample::Integer(-30000))]
#[case(ForeignType::UnsignedShort, Sample::Integer(60000))]
#[case(ForeignType::Int, Sample::Integer(-2_000_000_000))]
#[case(ForeignType::UnsignedInt, Sample::Integer(4_000_000_000))]
#[case(ForeignType::Long, Sample::Integer(-7))]
#[case(ForeignType::UnsignedLong, Sample::Integer(4_000_000_000))]
#[case(ForeignType::LongLong, Sample::Integer(-(1 << 40)))]
#[case(ForeignType::UnsignedLongLong, Sample::Integer(u64::MAX as i128))]
#[case(ForeignType::Int8, Sample::Integer(-128))]
#[case(ForeignType::Uint8, Sample::Integer(255))]
#[case(ForeignType::Int16, Sample::Integer(-32768))]
#[case(ForeignType::Uint16, Sample::Integer(65535))]
#[case(ForeignType::Int32, Sample::Integer(i32::MIN as i128))]
#[case(ForeignType::Uint32, Sample::Integer(u32::MAX as i128))]
#[case(ForeignType::Int64, Sample::Integer(i64::MIN as i128))]
#[case(ForeignType::Uint64, Sample::Integer(u64::MAX as i128))]
#[case(ForeignType::Float, Sample::Plain(Value::Single(1.5)))]
#[case(ForeignType::Double, Sample::Plain(Value::Double(-2.25)))]
#[case(ForeignType::PointerVoid, Sample::Plain(Value::Pointer(0x1000)))]
#[case(ForeignType::CString, Sample::Text("hello"))]
#[case(ForeignType::Object, Sample::Plain(Value::Fixnum(12345)))]
fn test_round_trip(#[case] ty: ForeignType, #[case] sample: Sample) {
    let (runtime, mut ctx, _) = setup(small_config());
    let heap = Arc::clone(runtime.heap());
    let input = sample.build(heap.as_ref());
    let expected = describe(heap.as_ref(), &input);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sig = ForeignSignature::new(vec![ty], ty).unwrap();
    let trampoline = Trampoline::new(&runtime, sig.clone(), identity(&seen)).unwrap();
    let native = unsafe { ForeignFunction::new("identity", trampoline.code_ptr(), sig) };

    let output = native.call(&mut ctx, &[input]).unwrap();
    assert!(trampoline.take_error().is_none());
    assert_eq!(seen.lock().unwrap().clone(), vec![expected.clone()]);
    assert_eq!(describe(heap.as_ref(), &output), expected, "{}", ty);
}

#[test]
fn test_void_callback() {
    let (runtime, mut ctx, events) = setup(small_config());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = {
        let seen = Arc::clone(&seen);
        NativeFunction::fixed("record", 1, move |ctx, frame| {
            let value = ctx.arg(frame, 0)?;
            seen.lock().unwrap().push(value);
            Ok(ctx.clear_values())
        })
    };
    let sig = ForeignSignature::new(vec![ForeignType::Int], ForeignType::Void).unwrap();
    let trampoline = Trampoline::new(&runtime, sig.clone(), Arc::new(recorder)).unwrap();
    let native = unsafe { ForeignFunction::new("record", trampoline.code_ptr(), sig) };

    assert_eq!(native.call(&mut ctx, &[Value::Fixnum(9)]).unwrap(), Value::Nil);
    assert_eq!(ctx.value_count(), 0);
    assert_eq!(seen.lock().unwrap().clone(), vec![Value::Fixnum(9)]);
    assert!(events.events().contains(&RuntimeEvent::CallbackInvoked {
        signature: "record (:int) -> :void".to_string(),
    }));
}

#[test]
fn test_unmarshalable_result_returns_zero() {
    let (runtime, mut ctx, events) = setup(small_config());
    let sig = ForeignSignature::new(vec![ForeignType::Int], ForeignType::Uint8).unwrap();
    let too_big: Arc<dyn Callee> = Arc::new(NativeFunction::fixed("too-big", 1, |ctx, _| {
        Ok(ctx.set_value(Value::Fixnum(256)))
    }));
    let trampoline = Trampoline::new(&runtime, sig.clone(), too_big).unwrap();
    let native = unsafe { ForeignFunction::new("too-big", trampoline.code_ptr(), sig) };

    assert_eq!(native.call(&mut ctx, &[Value::Fixnum(1)]).unwrap(), Value::Fixnum(0));
    let err = trampoline.take_error().unwrap();
    assert!(matches!(err, RuntimeError::Marshal(_)), "{:?}", err);
    assert!(events
        .events()
        .iter()
        .any(|e| matches!(e, RuntimeEvent::CallbackFailed { .. })));
}

#[test]
fn test_callback_reenters_foreign_code() {
    extern "C" fn triple(x: i32) -> i32 {
        x * 3
    }

    let (runtime, mut ctx, _) = setup(small_config());
    let int_sig = ForeignSignature::new(vec![ForeignType::Int], ForeignType::Int).unwrap();
    let inner = unsafe {
        ForeignFunction::new(
            "triple",
            kiln_runtime::EntryPoint::from_addr(triple as usize),
            int_sig.clone(),
        )
    };
    let plus_one_tripled: Arc<dyn Callee> =
        Arc::new(NativeFunction::fixed("plus-one-tripled", 1, move |ctx, frame| {
            let Value::Fixnum(n) = ctx.arg(frame, 0)? else {
                return Err(RuntimeError::TypeError {
                    expected: "fixnum",
                    got: "non-fixnum",
                });
            };
            let tripled = inner.call(ctx, &[Value::Fixnum(n + 1)])?;
            Ok(ctx.set_value(tripled))
        }));
    let trampoline = Trampoline::new(&runtime, int_sig.clone(), plus_one_tripled).unwrap();
    let outer = unsafe { ForeignFunction::new("outer", trampoline.code_ptr(), int_sig) };

    assert_eq!(outer.call(&mut ctx, &[Value::Fixnum(4)]).unwrap(), Value::Fixnum(15));
    assert_eq!(ctx.frame_depth(), 0);
}
