// Copyright (c) 2023, The rlambda contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use crate::config::{InvalidConfig, RateControlConfig};
use crate::gop::GopBudget;
use crate::history::PictureHistory;
use crate::picture::{PictureRateControl, SliceType};
use crate::sequence::SequenceRateState;

/// The rate control context for one encode.
///
/// Owns all mutable controller state and cascades the sequence bit budget
/// down to GOPs, pictures and CTUs. The encoder drives it strictly in
/// coding order:
///
/// 1. [`init_gop`](Self::init_gop) at each GOP boundary,
/// 2. [`init_picture`](Self::init_picture), then
///    [`estimate_picture_lambda`](Self::estimate_picture_lambda) and
///    [`estimate_picture_qp`](Self::estimate_picture_qp) per picture,
/// 3. [`ctu_target_bpp`](Self::ctu_target_bpp) /
///    [`ctu_estimate_lambda`](Self::ctu_estimate_lambda) /
///    [`ctu_estimate_qp`](Self::ctu_estimate_qp) /
///    [`update_after_ctu`](Self::update_after_ctu) per CTU in raster
///    order,
/// 4. [`update_after_picture`](Self::update_after_picture) after the last
///    CTU, and [`update_after_gop`](Self::update_after_gop) after the last
///    picture.
///
/// Every estimate depends on state left by the previous picture and CTU,
/// so a parallel encoder must serialize these calls back into coding
/// order. None of the methods fail: every formula bottoms out in a floor
/// or clamp instead.
pub struct RateControl {
  seq: SequenceRateState,
  history: PictureHistory,
  gop: Option<GopBudget>,
  pic: Option<PictureRateControl>,
}

impl RateControl {
  /// Creates a controller for one encode.
  ///
  /// # Errors
  ///
  /// Returns `InvalidConfig` if the configuration is invalid.
  pub fn new(cfg: &RateControlConfig) -> Result<RateControl, InvalidConfig> {
    cfg.validate()?;
    Ok(RateControl {
      seq: SequenceRateState::new(cfg),
      history: PictureHistory::new(),
      gop: None,
      pic: None,
    })
  }

  /// Frames not yet finalized.
  pub fn frames_left(&self) -> usize {
    self.seq.frames_left
  }

  /// Bits of the sequence budget not yet consumed.
  pub fn bits_left(&self) -> i64 {
    self.seq.bits_left
  }

  /// The hierarchy level driving the model of GOP position `position`.
  pub fn frame_level_of(&self, position: usize) -> usize {
    self.seq.level_of_gop_position[position.min(self.seq.gop_size - 1)]
  }

  /// Opens a GOP of `num_pictures` pictures and fixes its bit allocation.
  pub fn init_gop(&mut self, num_pictures: usize) {
    debug_assert!(self.pic.is_none(), "picture still open");
    debug_assert!(num_pictures >= 1 && num_pictures <= self.seq.gop_size);
    self.gop = Some(GopBudget::new(&mut self.seq, num_pictures));
  }

  /// Opens the next picture of the current GOP at hierarchy level
  /// `frame_level` (0 for intra pictures).
  pub fn init_picture(&mut self, frame_level: usize) {
    debug_assert!(self.pic.is_none(), "picture still open");
    let gop = self.gop.as_ref().expect("init_gop must precede init_picture");
    debug_assert!(gop.pictures_left > 0, "GOP already fully coded");
    let position = gop.position().min(gop.num_pictures - 1);
    self.pic = Some(PictureRateControl::new(
      &self.seq,
      gop.bits_left,
      &gop.ratios,
      position,
      gop.preallocated(position),
      &self.history,
      frame_level,
    ));
  }

  /// Opens the next picture at the hierarchy level configured for GOP
  /// position `gop_position`.
  pub fn init_picture_at(&mut self, gop_position: usize) {
    self.init_picture(self.frame_level_of(gop_position));
  }

  /// The bit target of the open picture.
  pub fn picture_target_bits(&self) -> i64 {
    self.pic().target_bits()
  }

  /// The header-bit overhead expected for the open picture.
  pub fn picture_estimated_header_bits(&self) -> i64 {
    self.pic().estimated_header_bits()
  }

  /// The lambda most recently estimated for the open picture.
  pub fn picture_estimated_lambda(&self) -> f64 {
    self.pic().estimated_lambda()
  }

  /// The QP most recently estimated for the open picture.
  pub fn picture_estimated_qp(&self) -> i32 {
    self.pic().estimated_qp()
  }

  /// Supplies the per-CTU intra prediction costs for the open picture.
  pub fn set_intra_costs(&mut self, costs: &[f64]) {
    self.pic_mut().set_intra_costs(costs);
  }

  /// Refines the open intra picture's bit target from its measured
  /// prediction cost; returns the new target.
  pub fn refine_bits_for_intra(&mut self, org_bits: i64) -> i64 {
    self.pic_mut().refine_bits_for_intra(org_bits)
  }

  /// Estimates the lambda the open picture should be encoded with.
  pub fn estimate_picture_lambda(&mut self, slice_type: SliceType) -> f64 {
    let pic = self.pic.as_mut().expect("no picture open");
    pic.estimate_lambda(&self.seq, &self.history, slice_type)
  }

  /// Estimates the picture QP realizing `lambda`.
  pub fn estimate_picture_qp(&mut self, lambda: f64) -> i32 {
    let pic = self.pic.as_mut().expect("no picture open");
    pic.estimate_qp(&self.history, lambda)
  }

  /// Bit target for the next CTU, in bits per pixel.
  pub fn ctu_target_bpp(&mut self) -> f64 {
    self.pic_mut().ctu_target_bpp()
  }

  /// Lambda for the next CTU at a target rate of `bpp`.
  pub fn ctu_estimate_lambda(&mut self, bpp: f64) -> f64 {
    let pic = self.pic.as_ref().expect("no picture open");
    pic.ctu_estimate_lambda(&self.seq, bpp)
  }

  /// QP for the next CTU.
  pub fn ctu_estimate_qp(&mut self, lambda: f64, pic_qp: i32) -> i32 {
    self.pic().ctu_estimate_qp(lambda, pic_qp)
  }

  /// Books the encoded CTU `idx`. Results must arrive in raster order.
  pub fn update_after_ctu(
    &mut self, idx: usize, actual_bits: i64, qp: i32, lambda: f64,
  ) {
    let pic = self.pic.as_mut().expect("no picture open");
    pic.update_after_ctu(&mut self.seq, idx, actual_bits, qp, lambda);
  }

  /// Closes the open picture: feeds the measured totals back into the
  /// level model, rolls the GOP and sequence budgets forward, and archives
  /// the picture for the clamping stages.
  pub fn update_after_picture(
    &mut self, header_bits: i64, total_bits: i64, avg_qp: i32,
    avg_lambda: f64, slice_type: SliceType,
  ) {
    let mut pic = self.pic.take().expect("no picture open");
    pic.update_after_picture(
      &mut self.seq,
      header_bits,
      total_bits,
      avg_qp,
      avg_lambda,
      slice_type,
    );
    let gop = self.gop.as_mut().expect("no GOP open");
    gop.update_after_picture(total_bits);
    self.seq.update_after_picture(total_bits);
    self.history.push(pic);
  }

  /// Closes the current GOP.
  pub fn update_after_gop(&mut self) {
    debug_assert!(self.pic.is_none(), "picture still open");
    if let Some(gop) = self.gop.take() {
      log::debug!(
        "gop done: target {} bits, balance {}",
        gop.target_bits,
        gop.bits_left
      );
    }
  }

  fn pic(&self) -> &PictureRateControl {
    self.pic.as_ref().expect("no picture open")
  }

  fn pic_mut(&mut self) -> &mut PictureRateControl {
    self.pic.as_mut().expect("no picture open")
  }
}
