/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Register dependency conditions attached to OOL entry labels.

use crate::{RealReg, VirtReg};

/// A set of post-conditions pinning virtuals to specific physical
/// registers (or to [`RealReg::SPILLED`] for virtuals that live in
/// memory) at the point the condition is attached.
#[derive(Clone, Debug, Default)]
pub struct RegDeps {
    post: Vec<(VirtReg, RealReg)>,
}

impl RegDeps {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            post: Vec::with_capacity(n),
        }
    }

    pub fn add_post_condition(&mut self, virt: VirtReg, real: RealReg) {
        self.post.push((virt, real));
    }

    #[inline(always)]
    pub fn post_conditions(&self) -> &[(VirtReg, RealReg)] {
        &self.post
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.post.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.post.is_empty()
    }
}
