#![deny(clippy::all, warnings)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

pub mod reference;

pub use reference::{PackageReference, RecipeReference, ReferenceError};
