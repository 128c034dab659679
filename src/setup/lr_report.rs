use crate::error::{Result, SetupError};
use crate::training::MetricsSink;

/// Emit one `lr/<name>` scalar per active group at `step`.
///
/// `adjust` maps the scheduler's raw rates to the rates the optimizer applies.
/// The rate count must match the group count before anything is recorded.
pub fn report(
    names: &[&str],
    rates: Vec<f64>,
    adjust: impl FnOnce(Vec<f64>) -> Vec<f64>,
    sink: &mut dyn MetricsSink,
    step: usize,
) -> Result<()> {
    if rates.len() != names.len() {
        return Err(SetupError::LearningRateMismatch {
            names: names.iter().map(|n| n.to_string()).collect(),
            rates: rates.len(),
        });
    }

    for (name, lr) in names.iter().zip(adjust(rates)) {
        sink.add_scalar(&format!("lr/{}", name), lr, step)?;
    }
    Ok(())
}
