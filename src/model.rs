// Copyright (c) 2023, The rlambda contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use crate::util::clamp;

// Initial model parameters for inter pictures. These were fitted offline
//  over a large test set and are only a starting point; the per-picture
//  feedback loop takes over after the first few frames.
pub(crate) const INTER_ALPHA: f64 = 3.2003;
pub(crate) const INTER_BETA: f64 = -1.367;

// Initial parameters for the intra flavor of the model, which relates the
//  per-pixel intra prediction cost to the rate instead of the rate alone.
pub(crate) const INTRA_ALPHA: f64 = 6.7542;
pub(crate) const INTRA_BETA: f64 = 1.7860;

// The summed intra cost is mapped to a per-pixel complexity with this
//  exponent before entering the model.
pub(crate) const INTRA_COST_EXP: f64 = 1.2517;

const ALPHA_MIN: f64 = 0.05;
const ALPHA_MAX: f64 = 500.0;
const BETA_MIN: f64 = -3.0;
const BETA_MAX: f64 = -0.1;
// The intra flavor uses beta as a positive cost exponent, so it clamps to
//  its own band.
const INTRA_BETA_MIN: f64 = 0.1;
const INTRA_BETA_MAX: f64 = 3.0;

// lambda and QP are related by QP = slope*ln(lambda) + offset.
const QP_SLOPE: f64 = 4.2005;
const QP_OFFSET: f64 = 13.7122;

pub(crate) const MIN_QP: i32 = 0;
pub(crate) const MAX_QP: i32 = 51;

// Absolute band any picture lambda is kept inside.
pub(crate) const LAMBDA_MIN: f64 = 0.1;
pub(crate) const LAMBDA_MAX: f64 = 10000.0;

/// One rate-distortion model pair `(alpha, beta)`.
///
/// For inter pictures the model is `lambda = alpha * bpp^beta` with
/// `beta < 0`. For intra pictures the same pair parameterizes the
/// cost-weighted variant `lambda = (alpha/256) * (cost_per_pixel/bpp)^beta`
/// with `beta > 0`. Both flavors are corrected from single noisy
/// observations, so every write is damped and clamped.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RdModel {
  alpha: f64,
  beta: f64,
  intra: bool,
}

impl RdModel {
  /// The initial fit for inter pictures.
  pub fn inter() -> RdModel {
    RdModel { alpha: INTER_ALPHA, beta: INTER_BETA, intra: false }
  }

  /// The initial fit for intra pictures.
  pub fn intra() -> RdModel {
    RdModel { alpha: INTRA_ALPHA, beta: INTRA_BETA, intra: true }
  }

  // Rebuilds an inter model from a stored `(alpha, beta)` snapshot.
  pub(crate) fn with_params(alpha: f64, beta: f64) -> RdModel {
    let mut m = RdModel::inter();
    m.set(alpha, beta);
    m
  }

  pub fn alpha(&self) -> f64 {
    self.alpha
  }

  pub fn beta(&self) -> f64 {
    self.beta
  }

  // All writes funnel through here so the bound invariant holds at all
  //  times.
  fn set(&mut self, alpha: f64, beta: f64) {
    self.alpha = clamp(alpha, ALPHA_MIN, ALPHA_MAX);
    self.beta = if self.intra {
      clamp(beta, INTRA_BETA_MIN, INTRA_BETA_MAX)
    } else {
      clamp(beta, BETA_MIN, BETA_MAX)
    };
  }

  /// Estimated lambda for a target rate of `bpp` bits per pixel.
  pub fn estimate(&self, bpp: f64) -> f64 {
    self.alpha * bpp.powf(self.beta)
  }

  /// Intra estimate from the per-pixel prediction cost and the target rate.
  pub fn estimate_intra(&self, cost_per_pixel: f64, bpp: f64) -> f64 {
    (self.alpha / 256.0) * (cost_per_pixel / bpp).powf(self.beta)
  }

  /// Corrects the model from one observed `(actual_bits, lambda_in)`
  /// sample.
  ///
  /// Pathological observations (all-skip pictures, a collapsed lambda)
  /// decay the model toward neutral instead of fitting it, so a run of
  /// such samples cannot drive `alpha`/`beta` out of their bounds or into
  /// NaN.
  pub fn update(
    &mut self, actual_bits: i64, pixels: usize, lambda_in: f64,
    alpha_rate: f64, beta_rate: f64,
  ) {
    let bpp = actual_bits as f64 / pixels as f64;
    let calc = self.estimate(bpp);
    if lambda_in < 0.01 || calc < 0.01 || bpp < 0.0001 {
      log::trace!(
        "degenerate rc sample (bpp {:.6}, lambda {:.4}), decaying model",
        bpp,
        lambda_in
      );
      let alpha = self.alpha * (1.0 - alpha_rate / 2.0);
      let beta = self.beta * (1.0 - beta_rate / 2.0);
      self.set(alpha, beta);
      return;
    }
    let calc = clamp(calc, lambda_in / 10.0, lambda_in * 10.0);
    let delta = lambda_in.ln() - calc.ln();
    let alpha = self.alpha + alpha_rate * delta * self.alpha;
    let lnbpp = clamp(bpp.ln(), -5.0, -0.1);
    let beta = self.beta + beta_rate * delta * lnbpp;
    self.set(alpha, beta);
  }

  /// Intra-flavor correction: compares produced bits against the target
  /// instead of lambdas, damped to an eighth of a step per picture.
  pub fn update_intra(
    &mut self, actual_bits: i64, target_bits: i64, cost_per_pixel: f64,
  ) {
    if actual_bits <= 0 || target_bits <= 0 {
      return;
    }
    let diff = clamp(
      0.25
        * self.beta
        * ((actual_bits as f64).ln() - (target_bits as f64).ln()),
      -0.125,
      0.125,
    );
    let alpha = self.alpha * diff.exp();
    let lncost = cost_per_pixel.powf(INTRA_COST_EXP).ln();
    // A flat picture puts the cost term near 1; leave beta alone rather
    //  than dividing by a vanishing log.
    let beta = if lncost.abs() < 0.01 {
      self.beta
    } else {
      self.beta + diff / lncost
    };
    self.set(alpha, beta);
  }
}

/// Converts a lambda into the quantizer index that realizes it, clamped to
/// the valid coding range.
pub fn lambda_to_qp(lambda: f64) -> i32 {
  let qp = (QP_SLOPE * lambda.ln() + QP_OFFSET).round() as i32;
  clamp(qp, MIN_QP, MAX_QP)
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn worked_estimate() {
    let m = RdModel::inter();
    let lambda = m.estimate(0.1);
    assert!((lambda - 74.5).abs() < 0.5);
    assert_eq!(lambda_to_qp(lambda), 32);
  }

  #[test]
  fn estimate_is_deterministic() {
    let m = RdModel::inter();
    assert_eq!(m.estimate(0.037), m.estimate(0.037));
  }

  #[test]
  fn estimate_monotone_for_negative_beta() {
    let m = RdModel::inter();
    let mut last = f64::INFINITY;
    for i in 1..100 {
      let bpp = i as f64 * 0.01;
      let lambda = m.estimate(bpp);
      assert!(lambda <= last);
      last = lambda;
    }
  }

  #[test]
  fn update_keeps_bounds() {
    let mut m = RdModel::inter();
    // Hammer the model with wildly mismatched observations in both
    //  directions.
    for i in 0..200 {
      let bits = if i % 2 == 0 { 1 } else { 10_000_000 };
      let lambda = if i % 2 == 0 { 9000.0 } else { 0.11 };
      m.update(bits, 256 * 256, lambda, 0.4, 0.2);
      assert!(m.alpha() >= ALPHA_MIN && m.alpha() <= ALPHA_MAX);
      assert!(m.beta() >= BETA_MIN && m.beta() <= BETA_MAX);
      assert!(m.alpha().is_finite() && m.beta().is_finite());
    }
  }

  #[test]
  fn degenerate_sample_decays() {
    let mut m = RdModel::inter();
    let (a0, b0) = (m.alpha(), m.beta());
    m.update(0, 256 * 256, 50.0, 0.1, 0.05);
    assert!(m.alpha() < a0);
    assert!(m.beta().abs() < b0.abs());
    assert!(m.alpha() >= ALPHA_MIN && m.beta() >= BETA_MIN);
    // Keep decaying; the model must never escape its bounds or go NaN.
    for _ in 0..1000 {
      m.update(0, 256 * 256, 50.0, 0.1, 0.05);
    }
    assert!(m.alpha() >= ALPHA_MIN && m.beta() <= BETA_MAX);
    assert!(m.alpha().is_finite() && m.beta().is_finite());
  }

  #[test]
  fn intra_update_is_damped() {
    let mut m = RdModel::intra();
    let a0 = m.alpha();
    // Overshoot by 4x; alpha may move at most e^0.125 in one step.
    m.update_intra(400_000, 100_000, 12.0);
    assert!(m.alpha() / a0 <= 0.125f64.exp() + 1e-9);
    assert!(m.beta() >= INTRA_BETA_MIN && m.beta() <= INTRA_BETA_MAX);
  }

  #[test]
  fn qp_range_is_clamped() {
    assert_eq!(lambda_to_qp(1e-9), MIN_QP);
    assert_eq!(lambda_to_qp(1e12), MAX_QP);
  }
}
