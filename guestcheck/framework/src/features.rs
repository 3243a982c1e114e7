// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Optional test features, resolved from params once when a test starts.
//!
//! Many tests do extra work only when a parameter is present (`cmd_dd`,
//! `fio_options`, `setup_local_nfs`...). Rather than probing params again at
//! every step, a test defines an enum of its features and resolves them into
//! a [`FeatureSet`] up front.

use std::{collections::BTreeSet, fmt::Debug};

use strum::IntoEnumIterator;

use crate::params::Params;

pub trait Feature: Copy + Ord + Debug + IntoEnumIterator {
    /// Returns whether `params` turn this feature on.
    fn enabled_by(self, params: &Params) -> bool;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeatureSet<F: Feature>(BTreeSet<F>);

impl<F: Feature> FeatureSet<F> {
    pub fn resolve(params: &Params) -> Self {
        Self(F::iter().filter(|f| f.enabled_by(params)).collect())
    }

    pub fn has(&self, feature: F) -> bool {
        self.0.contains(&feature)
    }

    pub fn iter(&self) -> impl Iterator<Item = F> + '_ {
        self.0.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns whether any of `features` is enabled.
    pub fn any(&self, features: &[F]) -> bool {
        features.iter().any(|f| self.has(*f))
    }
}
