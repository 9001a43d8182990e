// Copyright (c) 2023, The rlambda contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use crate::history::PictureHistory;
use crate::model::{
  lambda_to_qp, RdModel, INTRA_COST_EXP, LAMBDA_MAX, LAMBDA_MIN, MAX_QP,
  MIN_QP,
};
use crate::sequence::SequenceRateState;
use crate::util::clamp;

// Per-picture floor for the coded data, on top of the estimated headers.
const PIC_MIN_DATA_BITS: i64 = 100;

// When at least this many frames remain, the per-position preallocation
//  dominates the picture target; near the end of the sequence the live
//  remainder takes over completely.
const PREALLOCATION_HORIZON: usize = 16;
const PREALLOCATION_WEIGHT: f64 = 0.9;
const REMAINDER_WEIGHT: f64 = 0.1;

// CTU-to-CTU deviations from the weight plan are amortized over this many
//  upcoming CTUs.
const CTU_SMOOTHING_WINDOW: usize = 4;

// The most recent coded picture clamps our lambda estimate from this band.
const LAST_PIC_LAMBDA_MAX: f64 = 2000.0;

// Intra budget refinement: produced bits scale with the prediction cost
//  raised to this exponent.
const INTRA_REFINE_EXP: f64 = 0.5582;

/// Picture coding type, as signaled by the encoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SliceType {
  /// Intra-only picture.
  I,
  /// Predicted picture.
  P,
  /// Bi-predicted picture.
  B,
}

// One coding-tree unit of the ledger.
#[derive(Clone, Copy, Debug, Default)]
struct CtuRecord {
  pixels: usize,
  // Raw model weight, before rescaling.
  bit_weight: f64,
  // The weight rescaled so the ledger sums to the picture target.
  target_bits: f64,
  intra_cost: f64,
  actual_bits: i64,
  qp: Option<i32>,
  lambda: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PictureState {
  Created,
  LambdaEstimated,
  QpEstimated,
  Encoding,
  Finalized,
}

/// The per-picture feedback unit: estimates the picture's bit target,
/// lambda and QP from the sequence models and the recent history, cascades
/// the target down to CTUs while the picture is being encoded, and feeds
/// the measured outcome back into the sequence models afterwards.
pub(crate) struct PictureRateControl {
  frame_level: usize,
  pixels: usize,
  num_ctus: usize,
  target_bits: i64,
  est_header_bits: i64,
  est_lambda: f64,
  est_qp: i32,
  // Snapshot of the model that produced the estimate; CTU estimates read
  //  it when no separate CTU table is enabled.
  pic_alpha: f64,
  pic_beta: f64,
  slice_type: SliceType,
  ctus_left: usize,
  bits_left: i64,
  pixels_left: usize,
  ledger: Vec<CtuRecord>,
  total_intra_cost: f64,
  remaining_intra_cost: f64,
  state: PictureState,
  actual_header_bits: i64,
  actual_bits: i64,
  actual_qp: Option<i32>,
  actual_lambda: f64,
}

impl PictureRateControl {
  pub fn new(
    seq: &SequenceRateState, gop_bits_left: i64, ratios: &[i64],
    position: usize, preallocated: i64, history: &PictureHistory,
    frame_level: usize,
  ) -> PictureRateControl {
    let frame_level = frame_level.min(seq.num_levels - 1);
    let pixels = seq.pixels_per_picture();
    let num_ctus = seq.ctus_per_picture();

    // The live share of what is left in the GOP for this position.
    let remaining_ratio: i64 = ratios[position..].iter().sum();
    let mut target_bits =
      (gop_bits_left * ratios[position] / remaining_ratio.max(1)).max(100);
    // Far from the end of the sequence, trust the plan made at GOP
    //  creation over the short-term remainder.
    if seq.frames_left > PREALLOCATION_HORIZON {
      target_bits = (REMAINDER_WEIGHT * target_bits as f64
        + PREALLOCATION_WEIGHT * preallocated as f64) as i64;
    }
    let est_header_bits = history.mean_header_bits_for_level(frame_level);
    if target_bits < est_header_bits + PIC_MIN_DATA_BITS {
      target_bits = est_header_bits + PIC_MIN_DATA_BITS;
    }

    let mut ledger = vec![CtuRecord::default(); num_ctus];
    for (idx, ctu) in ledger.iter_mut().enumerate() {
      let x = idx % seq.pic_width_in_ctus;
      let y = idx / seq.pic_width_in_ctus;
      let w = seq.ctu_width.min(seq.width - x * seq.ctu_width);
      let h = seq.ctu_height.min(seq.height - y * seq.ctu_height);
      ctu.pixels = w * h;
    }

    PictureRateControl {
      frame_level,
      pixels,
      num_ctus,
      target_bits,
      est_header_bits,
      est_lambda: 0.0,
      est_qp: 0,
      pic_alpha: 0.0,
      pic_beta: 0.0,
      slice_type: SliceType::P,
      ctus_left: num_ctus,
      bits_left: target_bits,
      pixels_left: pixels,
      ledger,
      total_intra_cost: 0.0,
      remaining_intra_cost: 0.0,
      state: PictureState::Created,
      actual_header_bits: 0,
      actual_bits: 0,
      actual_qp: None,
      actual_lambda: 0.0,
    }
  }

  pub fn frame_level(&self) -> usize {
    self.frame_level
  }

  pub fn target_bits(&self) -> i64 {
    self.target_bits
  }

  pub fn estimated_header_bits(&self) -> i64 {
    self.est_header_bits
  }

  pub fn estimated_lambda(&self) -> f64 {
    self.est_lambda
  }

  pub fn estimated_qp(&self) -> i32 {
    self.est_qp
  }

  pub fn actual_header_bits(&self) -> i64 {
    self.actual_header_bits
  }

  /// Bits booked through the CTU loop so far.
  pub fn coded_ctu_bits(&self) -> i64 {
    self.ledger.iter().map(|c| c.actual_bits).sum()
  }

  pub fn actual_qp(&self) -> Option<i32> {
    self.actual_qp
  }

  pub fn actual_lambda(&self) -> f64 {
    self.actual_lambda
  }

  /// Per-CTU intra prediction costs measured by the encoder's analysis
  /// pass. Enables the cost-weighted intra paths.
  pub fn set_intra_costs(&mut self, costs: &[f64]) {
    debug_assert_eq!(costs.len(), self.num_ctus);
    let mut total = 0.0;
    for (ctu, &cost) in self.ledger.iter_mut().zip(costs) {
      ctu.intra_cost = cost.max(0.0);
      total += ctu.intra_cost;
    }
    self.total_intra_cost = total;
    self.remaining_intra_cost = total;
  }

  /// Refines the intra picture's bit target from the measured prediction
  /// cost, replacing the GOP-share estimate. Returns the refined target.
  pub fn refine_bits_for_intra(&mut self, org_bits: i64) -> i64 {
    if self.total_intra_cost <= 0.0 || org_bits <= 0 {
      return self.target_bits;
    }
    // Busier pictures keep a bigger share of their nominal budget.
    let alpha =
      if org_bits * 40 < self.pixels as i64 { 0.25 } else { 0.30 };
    let refined = (alpha
      * (self.total_intra_cost * 4.0 / org_bits as f64)
        .powf(INTRA_REFINE_EXP)
      * org_bits as f64
      + 0.5) as i64;
    self.target_bits =
      refined.max(self.est_header_bits + PIC_MIN_DATA_BITS);
    self.bits_left = self.target_bits;
    self.target_bits
  }

  /// Estimates the picture lambda and plants the CTU bit weights.
  pub fn estimate_lambda(
    &mut self, seq: &SequenceRateState, history: &PictureHistory,
    slice_type: SliceType,
  ) -> f64 {
    debug_assert_eq!(self.state, PictureState::Created);
    self.slice_type = slice_type;
    let model = seq.pic_param(self.frame_level);
    let bpp = self.target_bits as f64 / self.pixels as f64;

    let mut est =
      if slice_type == SliceType::I && self.total_intra_cost > 0.0 {
        let cost_per_pixel = (self.total_intra_cost / self.pixels as f64)
          .powf(INTRA_COST_EXP);
        model.estimate_intra(cost_per_pixel, bpp)
      } else {
        model.estimate(bpp)
      };

    // Two clamping stages: against the last picture of the same level,
    //  then against the last picture outright. With no history at all the
    //  absolute band applies.
    if let Some(level_lambda) =
      history.last_lambda_for_level(self.frame_level)
    {
      let level_lambda = clamp(level_lambda, LAMBDA_MIN, LAMBDA_MAX);
      est = clamp(est, level_lambda * 0.5, level_lambda * 2.0);
    }
    if let Some(last_lambda) = history.last_lambda() {
      let last_lambda = clamp(last_lambda, LAMBDA_MIN, LAST_PIC_LAMBDA_MAX);
      est = clamp(
        est,
        last_lambda * 2f64.powf(-10.0 / 3.0),
        last_lambda * 2f64.powf(10.0 / 3.0),
      );
    } else {
      est = clamp(est, LAMBDA_MIN, LAMBDA_MAX);
    }
    if est < LAMBDA_MIN {
      est = LAMBDA_MIN;
    }

    self.est_lambda = est;
    self.pic_alpha = model.alpha();
    self.pic_beta = model.beta();
    self.plant_ctu_weights(seq, est);
    self.state = PictureState::LambdaEstimated;
    est
  }

  // Seeds each CTU's share of the picture target from the model the CTU
  //  will be coded with, then rescales so the ledger sums to the target.
  fn plant_ctu_weights(&mut self, seq: &SequenceRateState, lambda: f64) {
    let mut total = 0.0;
    for (idx, ctu) in self.ledger.iter_mut().enumerate() {
      let model = seq.ctu_param(self.frame_level, idx);
      let weight = (ctu.pixels as f64
        * (lambda / model.alpha()).powf(1.0 / model.beta()))
      .max(0.01);
      ctu.bit_weight = weight;
      total += weight;
    }
    for ctu in self.ledger.iter_mut() {
      ctu.target_bits = self.target_bits as f64 * ctu.bit_weight / total;
    }
  }

  /// Estimates the picture QP for `lambda`, clamped against the history.
  pub fn estimate_qp(
    &mut self, history: &PictureHistory, lambda: f64,
  ) -> i32 {
    debug_assert_eq!(self.state, PictureState::LambdaEstimated);
    let mut qp = lambda_to_qp(lambda);
    if let Some(level_qp) = history.last_qp_for_level(self.frame_level) {
      qp = clamp(qp, level_qp - 3, level_qp + 3);
    }
    if let Some(last_qp) = history.last_qp() {
      qp = clamp(qp, last_qp - 10, last_qp + 10);
    }
    qp = clamp(qp, MIN_QP, MAX_QP);
    self.est_qp = qp;
    self.state = PictureState::QpEstimated;
    qp
  }

  // The next CTU in raster order.
  fn cursor(&self) -> usize {
    self.num_ctus - self.ctus_left
  }

  /// Bit target for the next CTU, normalized to its pixel count.
  pub fn ctu_target_bpp(&mut self) -> f64 {
    debug_assert!(matches!(
      self.state,
      PictureState::QpEstimated | PictureState::Encoding
    ));
    self.state = PictureState::Encoding;
    let idx = self.cursor();
    let ctu_pixels = self.ledger[idx].pixels as f64;

    let avg_bits = if self.slice_type == SliceType::I
      && self.total_intra_cost > 0.0
    {
      if self.remaining_intra_cost > 0.1 {
        // Spend what is left proportionally to the intra cost still ahead.
        let cost = self.ledger[idx].intra_cost;
        let bits =
          self.bits_left as f64 * cost / self.remaining_intra_cost;
        self.remaining_intra_cost -= cost;
        bits
      } else {
        // Cost table exhausted; spread the remainder per pixel.
        self.bits_left as f64 * ctu_pixels
          / self.pixels_left.max(1) as f64
      }
    } else {
      // Planned share, minus the plan-versus-actual drift amortized over
      //  the smoothing window.
      let planned_left: f64 =
        self.ledger[idx..].iter().map(|c| c.target_bits).sum();
      let window = CTU_SMOOTHING_WINDOW.min(self.ctus_left).max(1) as f64;
      self.ledger[idx].target_bits
        - (planned_left - self.bits_left as f64) / window
    };
    avg_bits.max(1.0) / ctu_pixels
  }

  /// Lambda for the next CTU at a target rate of `bpp`.
  pub fn ctu_estimate_lambda(
    &self, seq: &SequenceRateState, bpp: f64,
  ) -> f64 {
    debug_assert_eq!(self.state, PictureState::Encoding);
    let idx = self.cursor();
    let model = if seq.ctu_separate_model() {
      seq.ctu_param(self.frame_level, idx)
    } else {
      // The snapshot taken at picture estimation time.
      RdModel::with_params(self.pic_alpha, self.pic_beta)
    };
    let mut est = model.estimate(bpp);
    if let Some(prev) = self.last_coded_lambda(idx) {
      est = clamp(
        est,
        prev * 2f64.powf(-1.0 / 3.0),
        prev * 2f64.powf(1.0 / 3.0),
      );
    }
    est = clamp(
      est,
      self.est_lambda * 2f64.powf(-2.0 / 3.0),
      self.est_lambda * 2f64.powf(2.0 / 3.0),
    );
    est.max(LAMBDA_MIN)
  }

  /// QP for the next CTU, clamped against its coded neighbor and the
  /// picture QP.
  pub fn ctu_estimate_qp(&self, lambda: f64, pic_qp: i32) -> i32 {
    debug_assert_eq!(self.state, PictureState::Encoding);
    let mut qp = lambda_to_qp(lambda);
    if let Some(prev) = self.last_coded_qp(self.cursor()) {
      qp = clamp(qp, prev - 1, prev + 1);
    }
    qp = clamp(qp, pic_qp - 2, pic_qp + 2);
    clamp(qp, MIN_QP, MAX_QP)
  }

  fn last_coded_lambda(&self, before: usize) -> Option<f64> {
    self.ledger[..before].iter().rev().find_map(|c| c.lambda)
  }

  fn last_coded_qp(&self, before: usize) -> Option<i32> {
    self.ledger[..before].iter().rev().find_map(|c| c.qp)
  }

  /// Books the encoded CTU into the ledger and, when the separate CTU
  /// table is enabled, corrects that CTU's own model.
  pub fn update_after_ctu(
    &mut self, seq: &mut SequenceRateState, idx: usize, actual_bits: i64,
    qp: i32, lambda: f64,
  ) {
    debug_assert_eq!(self.state, PictureState::Encoding);
    debug_assert_eq!(idx, self.cursor(), "CTU results must arrive in order");
    let ctu = &mut self.ledger[idx];
    ctu.actual_bits = actual_bits;
    ctu.qp = Some(qp);
    ctu.lambda = Some(lambda);
    self.ctus_left -= 1;
    self.bits_left -= actual_bits;
    self.pixels_left = self.pixels_left.saturating_sub(ctu.pixels);

    if seq.ctu_separate_model() {
      let pixels = self.ledger[idx].pixels;
      let mut model = seq.ctu_param(self.frame_level, idx);
      model.update(
        actual_bits,
        pixels,
        lambda,
        seq.alpha_update_rate,
        seq.beta_update_rate,
      );
      seq.set_ctu_param(self.frame_level, idx, model);
    }
  }

  /// Records the finished picture and feeds the measured outcome back into
  /// the sequence-level model for this level.
  pub fn update_after_picture(
    &mut self, seq: &mut SequenceRateState, header_bits: i64,
    total_bits: i64, avg_qp: i32, avg_lambda: f64, slice_type: SliceType,
  ) {
    debug_assert_ne!(self.state, PictureState::Finalized);
    self.actual_header_bits = header_bits;
    self.actual_bits = total_bits;
    self.actual_qp = (MIN_QP..=MAX_QP).contains(&avg_qp).then_some(avg_qp);
    self.actual_lambda = avg_lambda;

    let mut model = seq.pic_param(self.frame_level);
    if slice_type == SliceType::I && self.total_intra_cost > 0.0 {
      model.update_intra(
        total_bits,
        self.target_bits,
        self.total_intra_cost / self.pixels as f64,
      );
    } else {
      model.update(
        total_bits,
        self.pixels,
        avg_lambda,
        seq.alpha_update_rate,
        seq.beta_update_rate,
      );
    }
    seq.set_pic_param(self.frame_level, model);

    // The top inter level seeds the adaptive weight re-solve.
    if self.frame_level == 1 {
      seq.blend_last_lambda(avg_lambda);
    }

    log::debug!(
      "pic done: level {}, target {} actual {} bits ({} in CTUs), qp {:?}, \
       lambda {:.2}",
      self.frame_level,
      self.target_bits,
      self.actual_bits,
      self.coded_ctu_bits(),
      self.actual_qp,
      avg_lambda
    );
    self.state = PictureState::Finalized;
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::config::RateControlConfig;
  use crate::gop::GopBudget;
  use crate::history::PictureHistory;
  use crate::sequence::SequenceRateState;

  fn setup() -> (SequenceRateState, GopBudget, PictureHistory) {
    let cfg = RateControlConfig::new();
    let mut seq = SequenceRateState::new(&cfg);
    let gop = GopBudget::new(&mut seq, 4);
    (seq, gop, PictureHistory::new())
  }

  fn picture(
    seq: &SequenceRateState, gop: &GopBudget, history: &PictureHistory,
    level: usize,
  ) -> PictureRateControl {
    let pos = gop.position();
    PictureRateControl::new(
      seq,
      gop.bits_left,
      &gop.ratios,
      pos,
      gop.preallocated(pos),
      history,
      level,
    )
  }

  #[test]
  fn target_floors_above_headers() {
    let cfg = RateControlConfig::new().with_target_bitrate(1);
    let mut seq = SequenceRateState::new(&cfg);
    let gop = GopBudget::new(&mut seq, 4);
    let history = PictureHistory::new();
    let pic = picture(&seq, &gop, &history, 1);
    assert!(
      pic.target_bits() >= pic.estimated_header_bits() + PIC_MIN_DATA_BITS
    );
  }

  #[test]
  fn bootstrap_clamps_to_absolute_band() {
    // First picture of a session: no history at all. Starve the target so
    //  the raw estimate explodes, then check the absolute band catches it.
    let cfg = RateControlConfig::new().with_target_bitrate(1);
    let mut seq = SequenceRateState::new(&cfg);
    let gop = GopBudget::new(&mut seq, 4);
    let history = PictureHistory::new();
    let mut pic = picture(&seq, &gop, &history, 1);
    let lambda = pic.estimate_lambda(&seq, &history, SliceType::P);
    assert!((LAMBDA_MIN..=LAMBDA_MAX).contains(&lambda));
  }

  #[test]
  fn ctu_weights_sum_to_target() {
    let (seq, gop, history) = setup();
    let mut pic = picture(&seq, &gop, &history, 1);
    pic.estimate_lambda(&seq, &history, SliceType::P);
    let planned: f64 = pic.ledger.iter().map(|c| c.target_bits).sum();
    assert!((planned - pic.target_bits() as f64).abs() < 1e-6);
    assert!(pic.ledger.iter().all(|c| c.bit_weight >= 0.01));
  }

  #[test]
  fn edge_ctus_have_partial_pixels() {
    // 640x480 with 64-wide CTUs: full grid horizontally, 480 = 7*64 + 32.
    let (seq, gop, history) = setup();
    let pic = picture(&seq, &gop, &history, 1);
    assert_eq!(pic.ledger[0].pixels, 64 * 64);
    let last = pic.ledger.len() - 1;
    assert_eq!(pic.ledger[last].pixels, 64 * 32);
    let total: usize = pic.ledger.iter().map(|c| c.pixels).sum();
    assert_eq!(total, 640 * 480);
  }

  #[test]
  fn ctu_loop_respects_floors_and_bands() {
    let (mut seq, gop, history) = setup();
    let mut pic = picture(&seq, &gop, &history, 1);
    let pic_lambda = pic.estimate_lambda(&seq, &history, SliceType::P);
    let pic_qp = pic.estimate_qp(&history, pic_lambda);
    let num_ctus = pic.num_ctus;
    for idx in 0..num_ctus {
      let bpp = pic.ctu_target_bpp();
      assert!(bpp > 0.0);
      let lambda = pic.ctu_estimate_lambda(&seq, bpp);
      assert!(lambda >= LAMBDA_MIN);
      // Within the picture band.
      assert!(lambda <= pic_lambda * 2f64.powf(2.0 / 3.0) + 1e-9);
      let qp = pic.ctu_estimate_qp(lambda, pic_qp);
      assert!((pic_qp - 2..=pic_qp + 2).contains(&qp));
      assert!((MIN_QP..=MAX_QP).contains(&qp));
      // Report twice the planned bits to force drift correction.
      let planned = pic.ledger[idx].target_bits as i64;
      pic.update_after_ctu(&mut seq, idx, planned * 2, qp, lambda);
    }
    assert_eq!(pic.ctus_left, 0);
    assert_eq!(pic.pixels_left, 0);
  }

  #[test]
  fn intra_costs_drive_ctu_targets() {
    let (mut seq, gop, history) = setup();
    let mut pic = picture(&seq, &gop, &history, 0);
    let mut costs = vec![1.0; pic.num_ctus];
    // The first CTU is 9x busier than the rest.
    costs[0] = 9.0;
    pic.set_intra_costs(&costs);
    let lambda = pic.estimate_lambda(&seq, &history, SliceType::I);
    let qp = pic.estimate_qp(&history, lambda);
    let busy_bpp = pic.ctu_target_bpp();
    pic.update_after_ctu(&mut seq, 0, 10, qp, lambda);
    let plain_bpp = pic.ctu_target_bpp();
    assert!(busy_bpp > plain_bpp * 5.0);
  }

  #[test]
  fn intra_refinement_rescales_target() {
    let (seq, gop, history) = setup();
    let mut pic = picture(&seq, &gop, &history, 0);
    pic.set_intra_costs(&vec![100.0; pic.num_ctus]);
    let before = pic.target_bits();
    let refined = pic.refine_bits_for_intra(before);
    assert_eq!(refined, pic.target_bits());
    assert!(
      refined >= pic.estimated_header_bits() + PIC_MIN_DATA_BITS
    );
  }

  #[test]
  fn finalize_feeds_sequence_model() {
    let (mut seq, gop, history) = setup();
    let mut pic = picture(&seq, &gop, &history, 1);
    let lambda = pic.estimate_lambda(&seq, &history, SliceType::P);
    pic.estimate_qp(&history, lambda);
    let before = seq.pic_param(1);
    // Report a large overshoot at the estimated lambda; alpha must react.
    pic.update_after_picture(
      &mut seq,
      200,
      pic.target_bits() * 3,
      30,
      lambda,
      SliceType::P,
    );
    assert_ne!(seq.pic_param(1), before);
    assert_eq!(pic.actual_qp(), Some(30));
    assert_eq!(pic.actual_header_bits(), 200);
  }
}
