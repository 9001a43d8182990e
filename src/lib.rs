// Copyright (c) 2023, The rlambda contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Hierarchical R-λ rate control for video encoders.
//!
//! Given a target bitrate, a frame rate and a GOP structure, the
//! controller picks the quantization parameter and Lagrangian multiplier
//! for every picture and every coding-tree unit inside it, so that the
//! produced stream converges on the requested rate. It fits the
//! rate-distortion model `λ = α·bpp^β` online per hierarchy level from
//! the bit counts the encoder reports back, and cascades one sequence
//! budget down through GOPs and pictures to individual CTUs.
//!
//! The crate owns only the control arithmetic. Entropy coding, transforms,
//! motion estimation and bitstream writing live in the encoder driving it;
//! the controller consumes measured bits/QP/λ and returns targets.
//!
//! ```
//! use rlambda::{RateControl, RateControlConfig, SliceType};
//!
//! let cfg = RateControlConfig::new()
//!   .with_dimensions(128, 128)
//!   .with_frame_rate(30.0)
//!   .with_target_bitrate(400_000)
//!   .with_total_frames(4)
//!   .with_low_delay_gop(4);
//! let mut rc = RateControl::new(&cfg)?;
//!
//! rc.init_gop(4);
//! for _ in 0..4 {
//!   rc.init_picture(1);
//!   let lambda = rc.estimate_picture_lambda(SliceType::P);
//!   let pic_qp = rc.estimate_picture_qp(lambda);
//!   let target = rc.picture_target_bits();
//!   for ctu in 0..4 {
//!     let bpp = rc.ctu_target_bpp();
//!     let ctu_lambda = rc.ctu_estimate_lambda(bpp);
//!     let ctu_qp = rc.ctu_estimate_qp(ctu_lambda, pic_qp);
//!     // ... encode the CTU with ctu_qp / ctu_lambda ...
//!     rc.update_after_ctu(ctu, target / 4, ctu_qp, ctu_lambda);
//!   }
//!   rc.update_after_picture(64, target, pic_qp, lambda, SliceType::P);
//! }
//! rc.update_after_gop();
//! # Ok::<(), rlambda::InvalidConfig>(())
//! ```

mod config;
mod gop;
mod history;
mod model;
mod picture;
mod rate;
mod sequence;
mod util;

pub use config::{
  GopEntry, HierarchicalBits, InvalidConfig, RateControlConfig,
};
pub use model::{lambda_to_qp, RdModel};
pub use picture::SliceType;
pub use rate::RateControl;
