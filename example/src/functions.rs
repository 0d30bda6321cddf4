// Functions both demo nodes can run. Each binary compiles this module so the
// registrations are linked into it.

use distripool::remote_fn;

#[remote_fn]
pub fn square(x: i64) -> i64 {
    x * x
}

#[remote_fn]
pub fn add(a: i64, b: i64) -> i64 {
    a + b
}

#[remote_fn]
pub fn slow_square(x: i64, millis: u64) -> i64 {
    std::thread::sleep(std::time::Duration::from_millis(millis));
    x * x
}

#[remote_fn]
pub fn checked_sqrt(x: f64) -> anyhow::Result<f64> {
    anyhow::ensure!(x >= 0.0, "cannot take the square root of {}", x);
    Ok(x.sqrt())
}
