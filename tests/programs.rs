//! End-to-end guest programs executed at several promotion thresholds.
//!
//! Every program must produce the same exit code whether it is fully
//! interpreted (huge threshold), promoted after one interpreted pass
//! (threshold 1) or compiled from the first block entry (threshold 0).
//! Compiled segments run through the emulated backend so the native tier
//! is exercised on any host.

use irjit::parser::parse_module;
use irjit::runtime::Runtime;
use irjit::segment::Backend;

fn run_at(src: &str, threshold: u64) -> i64 {
    let module = parse_module(src).expect("guest program should parse");
    let mut runtime = Runtime::new(&module);
    runtime.set_threshold(threshold);
    runtime.set_backend(Backend::Emulated);
    runtime.run().expect("guest program should run")
}

macro_rules! guest_test {
    ($name:ident, $src:expr, $expected:expr) => {
        #[test]
        fn $name() {
            for threshold in [0, 1, u64::MAX] {
                assert_eq!(run_at($src, threshold), $expected, "threshold {threshold}");
            }
        }
    };
}

guest_test!(
    returns_literal,
    "define i64 @main() {\n  ret i64 42\n}\n",
    42
);

guest_test!(
    arithmetic_chain,
    r#"
define i64 @main() {
  %a = add i64 10, 5
  %b = mul i64 %a, 4
  %c = sub i64 %b, 18
  %d = sdiv i64 %c, 2
  %e = srem i64 %d, 16
  ret i64 %e
}
"#,
    5
);

guest_test!(
    bitwise_and_shifts,
    r#"
define i64 @main() {
  %a = and i64 255, 170
  %b = or i64 %a, 5
  %c = xor i64 %b, 15
  %d = shl i64 %c, 2
  %e = ashr i64 %d, 1
  ret i64 %e
}
"#,
    320
);

// sum = 0; for i in 1..=10 { sum += i }; return sum
guest_test!(
    loop_sum_one_to_ten,
    r#"
define i64 @main() {
entry:
  %sum = alloca i64, align 8
  %i = alloca i64, align 8
  store i64 0, ptr %sum
  store i64 1, ptr %i
  br label %cond
cond:
  %iv = load i64, ptr %i
  %c = icmp sle i64 %iv, 10
  br i1 %c, label %body, label %done
body:
  %s = load i64, ptr %sum
  %s2 = add i64 %s, %iv
  store i64 %s2, ptr %sum
  %i2 = add i64 %iv, 1
  store i64 %i2, ptr %i
  br label %cond
done:
  %r = load i64, ptr %sum
  ret i64 %r
}
"#,
    55
);

// Recursive factorial; a block ending in a call must resume its
// continuation segment after the callee returns.
guest_test!(
    recursive_factorial,
    r#"
define i64 @fact(i64 %n) {
entry:
  %stop = icmp sle i64 %n, 1
  br i1 %stop, label %base, label %rec
base:
  ret i64 1
rec:
  %m = sub i64 %n, 1
  %sub = call i64 @fact(i64 %m)
  %r = mul i64 %n, %sub
  ret i64 %r
}

define i64 @main() {
entry:
  %r = call i64 @fact(i64 6)
  ret i64 %r
}
"#,
    720
);

// Store {10, 20, 30, 40} through element pointers, then sum with a loop
// over a runtime index.
guest_test!(
    array_store_then_sum,
    r#"
define i64 @main() {
entry:
  %a = alloca [4 x i64], align 8
  %p0 = getelementptr [4 x i64], ptr %a, i64 0, i64 0
  store i64 10, ptr %p0
  %p1 = getelementptr [4 x i64], ptr %a, i64 0, i64 1
  store i64 20, ptr %p1
  %p2 = getelementptr [4 x i64], ptr %a, i64 0, i64 2
  store i64 30, ptr %p2
  %p3 = getelementptr [4 x i64], ptr %a, i64 0, i64 3
  store i64 40, ptr %p3
  %sum = alloca i64, align 8
  %i = alloca i64, align 8
  store i64 0, ptr %sum
  store i64 0, ptr %i
  br label %cond
cond:
  %iv = load i64, ptr %i
  %c = icmp slt i64 %iv, 4
  br i1 %c, label %body, label %done
body:
  %e = getelementptr [4 x i64], ptr %a, i64 0, i64 %iv
  %ev = load i64, ptr %e
  %s = load i64, ptr %sum
  %s2 = add i64 %s, %ev
  store i64 %s2, ptr %sum
  %i2 = add i64 %iv, 1
  store i64 %i2, ptr %i
  br label %cond
done:
  %r = load i64, ptr %sum
  ret i64 %r
}
"#,
    100
);

guest_test!(
    struct_field_access,
    r#"
define i64 @main() {
entry:
  %s = alloca { i64, i64 }, align 8
  %f0 = getelementptr { i64, i64 }, ptr %s, i64 0, i32 0
  store i64 7, ptr %f0
  %f1 = getelementptr { i64, i64 }, ptr %s, i64 0, i32 1
  store i64 35, ptr %f1
  %a = load i64, ptr %f0
  %b = load i64, ptr %f1
  %r = add i64 %a, %b
  ret i64 %r
}
"#,
    42
);

// Rows of a multi-dimensional array are pointers to independently
// allocated subarrays; the first row is reached by loading the row
// pointer at the base.
guest_test!(
    jagged_array_first_row,
    r#"
define i64 @main() {
entry:
  %m = alloca [2 x [3 x i64]], align 8
  %row = load ptr, ptr %m
  %e0 = getelementptr [3 x i64], ptr %row, i64 0, i64 0
  store i64 11, ptr %e0
  %e2 = getelementptr [3 x i64], ptr %row, i64 0, i64 2
  store i64 31, ptr %e2
  %a = load i64, ptr %e0
  %b = load i64, ptr %e2
  %r = add i64 %a, %b
  ret i64 %r
}
"#,
    42
);

guest_test!(
    globals_survive_calls,
    r#"
@acc = global i64 2

define i64 @bump(i64 %by) {
entry:
  %v = load i64, ptr @acc
  %v2 = add i64 %v, %by
  store i64 %v2, ptr @acc
  ret i64 %v2
}

define i64 @main() {
entry:
  %a = call i64 @bump(i64 10)
  %b = call i64 @bump(i64 30)
  %r = load i64, ptr @acc
  ret i64 %r
}
"#,
    42
);

guest_test!(
    sext_feeds_arithmetic,
    r#"
define i64 @main() {
entry:
  %narrow = add i32 40, 0
  %wide = sext i32 %narrow to i64
  %r = add i64 %wide, 2
  ret i64 %r
}
"#,
    42
);

// Two calls in one block: the continuation of the first call itself ends
// in a call and owns a second continuation.
guest_test!(
    chained_continuations,
    r#"
define i64 @double(i64 %n) {
entry:
  %r = mul i64 %n, 2
  ret i64 %r
}

define i64 @main() {
entry:
  %a = call i64 @double(i64 3)
  %b = call i64 @double(i64 %a)
  %c = add i64 %a, %b
  ret i64 %c
}
"#,
    18
);

#[test]
fn divide_by_zero_reports_a_fault() {
    let src = "define i64 @main() {\n  %x = sdiv i64 7, 0\n  ret i64 %x\n}\n";
    let module = parse_module(src).unwrap();
    let mut runtime = Runtime::new(&module);
    let fault = runtime.run().unwrap_err();
    assert!(fault.to_string().contains("divide by zero"));
}

#[test]
fn external_call_reports_a_fault() {
    let src = r#"
declare i64 @ext()

define i64 @main() {
  %x = call i64 @ext()
  ret i64 %x
}
"#;
    let module = parse_module(src).unwrap();
    let mut runtime = Runtime::new(&module);
    let fault = runtime.run().unwrap_err();
    assert!(fault.to_string().contains("External function call"));
}

#[test]
fn exit_codes_match_across_every_threshold() {
    let src = r#"
define i64 @mix(i64 %n) {
entry:
  %big = icmp sgt i64 %n, 50
  br i1 %big, label %high, label %low
high:
  %h = srem i64 %n, 17
  ret i64 %h
low:
  %l = mul i64 %n, 3
  ret i64 %l
}

define i64 @main() {
entry:
  %acc = alloca i64, align 8
  %i = alloca i64, align 8
  store i64 0, ptr %acc
  store i64 0, ptr %i
  br label %cond
cond:
  %iv = load i64, ptr %i
  %c = icmp slt i64 %iv, 20
  br i1 %c, label %body, label %done
body:
  %cur = load i64, ptr %acc
  %step = call i64 @mix(i64 %cur)
  %mixed = add i64 %step, %iv
  store i64 %mixed, ptr %acc
  %i2 = add i64 %iv, 1
  store i64 %i2, ptr %i
  br label %cond
done:
  %r = load i64, ptr %acc
  ret i64 %r
}
"#;
    let reference = run_at(src, u64::MAX);
    for threshold in [0, 1, 2, 3, 5, 8] {
        assert_eq!(run_at(src, threshold), reference, "threshold {threshold}");
    }
}
