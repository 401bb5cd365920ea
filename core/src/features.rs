/// Dense feature vectors over the model's score components.
///
/// One f32 per component, in the model's stable component order. Vectors are
/// owned by value: particles copy the chosen derivation's vector, the learner
/// owns its weights.

use std::ops::{AddAssign, DivAssign, Index, IndexMut, MulAssign, SubAssign};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector(Vec<f32>);

impl FeatureVector {
    pub fn zeros(n: usize) -> Self {
        FeatureVector(vec![0.0; n])
    }

    pub fn from_vec(values: Vec<f32>) -> Self {
        FeatureVector(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.0
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, f32> {
        self.0.iter()
    }

    /// Dot product accumulated in f64.
    pub fn dot(&self, other: &FeatureVector) -> f64 {
        debug_assert_eq!(self.len(), other.len());
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(&a, &b)| a as f64 * b as f64)
            .sum()
    }

    pub fn norm_sq(&self) -> f64 {
        self.dot(self)
    }

    pub fn norm(&self) -> f64 {
        self.norm_sq().sqrt()
    }

    /// self += scale * other
    pub fn add_scaled(&mut self, other: &FeatureVector, scale: f32) {
        assert_eq!(self.len(), other.len(), "feature length mismatch");
        for (a, &b) in self.0.iter_mut().zip(other.0.iter()) {
            *a += scale * b;
        }
    }
}

impl From<Vec<f32>> for FeatureVector {
    fn from(values: Vec<f32>) -> Self {
        FeatureVector(values)
    }
}

impl Index<usize> for FeatureVector {
    type Output = f32;

    fn index(&self, i: usize) -> &f32 {
        &self.0[i]
    }
}

impl IndexMut<usize> for FeatureVector {
    fn index_mut(&mut self, i: usize) -> &mut f32 {
        &mut self.0[i]
    }
}

impl AddAssign<&FeatureVector> for FeatureVector {
    fn add_assign(&mut self, rhs: &FeatureVector) {
        assert_eq!(self.len(), rhs.len(), "feature length mismatch");
        for (a, &b) in self.0.iter_mut().zip(rhs.0.iter()) {
            *a += b;
        }
    }
}

impl SubAssign<&FeatureVector> for FeatureVector {
    fn sub_assign(&mut self, rhs: &FeatureVector) {
        assert_eq!(self.len(), rhs.len(), "feature length mismatch");
        for (a, &b) in self.0.iter_mut().zip(rhs.0.iter()) {
            *a -= b;
        }
    }
}

impl MulAssign<f32> for FeatureVector {
    fn mul_assign(&mut self, rhs: f32) {
        for a in self.0.iter_mut() {
            *a *= rhs;
        }
    }
}

impl DivAssign<f32> for FeatureVector {
    fn div_assign(&mut self, rhs: f32) {
        for a in self.0.iter_mut() {
            *a /= rhs;
        }
    }
}
