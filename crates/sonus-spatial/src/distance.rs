//! Distance attenuation models (spec §4.I): inverse, linear and exponent,
//! each with a clamped variant that pins distance to `[reference, max]`
//! before the model is evaluated. All six yield gain 1 at `reference`
//! and are monotonically non-increasing past it.

/// Selects one of the three curve shapes and whether distance is clamped
/// to `[reference_distance, max_distance]` before evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceModel {
    Inverse { clamped: bool },
    Linear { clamped: bool },
    Exponent { clamped: bool },
}

/// Per-source distance attenuation parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceParams {
    pub model: DistanceModel,
    pub rolloff_factor: f32,
    pub reference_distance: f32,
    pub max_distance: f32,
}

impl DistanceParams {
    /// Gain multiplier for `distance` (listener-space, already
    /// `meters_per_unit`-scaled).
    pub fn attenuation(&self, distance: f32) -> f32 {
        let refdist = self.reference_distance.max(0.0);
        let maxdist = self.max_distance.max(refdist);
        let rolloff = self.rolloff_factor.max(0.0);

        match self.model {
            DistanceModel::Inverse { clamped } => {
                let d = if clamped { distance.clamp(refdist, maxdist) } else { distance.max(0.0) };
                if refdist < 1e-8 {
                    return 1.0;
                }
                let denom = refdist + rolloff * (d - refdist);
                if denom <= 1e-8 {
                    1.0
                } else {
                    refdist / denom
                }
            }
            DistanceModel::Linear { clamped } => {
                let d = if clamped { distance.clamp(refdist, maxdist) } else { distance.max(0.0) };
                let span = maxdist - refdist;
                if span < 1e-8 {
                    return 1.0;
                }
                let g = 1.0 - rolloff * (d - refdist) / span;
                g.max(0.0)
            }
            DistanceModel::Exponent { clamped } => {
                let d = if clamped { distance.clamp(refdist, maxdist) } else { distance.max(0.0) };
                if refdist < 1e-8 || d < 1e-8 {
                    return 1.0;
                }
                (d / refdist).powf(-rolloff)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn params(model: DistanceModel) -> DistanceParams {
        DistanceParams { model, rolloff_factor: 1.0, reference_distance: 2.0, max_distance: 20.0 }
    }

    #[test]
    fn all_models_unity_gain_at_reference_distance() {
        for model in [
            DistanceModel::Inverse { clamped: false },
            DistanceModel::Inverse { clamped: true },
            DistanceModel::Linear { clamped: false },
            DistanceModel::Linear { clamped: true },
            DistanceModel::Exponent { clamped: false },
            DistanceModel::Exponent { clamped: true },
        ] {
            let p = params(model);
            assert_relative_eq!(p.attenuation(2.0), 1.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn all_models_monotonically_non_increasing_past_reference() {
        for model in [
            DistanceModel::Inverse { clamped: false },
            DistanceModel::Linear { clamped: false },
            DistanceModel::Exponent { clamped: false },
        ] {
            let p = params(model);
            let mut last = p.attenuation(2.0);
            for d in [3.0, 5.0, 8.0, 12.0, 19.0] {
                let g = p.attenuation(d);
                assert!(g <= last + 1e-6, "{model:?} not monotonic: {last} -> {g} at {d}");
                last = g;
            }
        }
    }

    #[test]
    fn clamped_variant_holds_gain_constant_beyond_max_distance() {
        let p = params(DistanceModel::Inverse { clamped: true });
        let at_max = p.attenuation(20.0);
        let beyond = p.attenuation(100.0);
        assert_relative_eq!(at_max, beyond, epsilon = 1e-6);
    }

    #[test]
    fn linear_model_reaches_zero_at_max_distance() {
        let p = params(DistanceModel::Linear { clamped: true });
        assert_relative_eq!(p.attenuation(20.0), 0.0, epsilon = 1e-4);
    }
}
