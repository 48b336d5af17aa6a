//! One adapter per remote endpoint. Each keeps its request and payload shape
//! to itself so upstream drift stays contained.

mod conversion;
mod diagnostic;
mod listing;
mod product;
mod reservation;
mod spu;

pub use conversion::ConversionAdapter;
pub use diagnostic::{promotion_score, DiagnosticAdapter};
pub use listing::{ListingAdapter, ListingPage};
pub use product::ProductTableAdapter;
pub use reservation::ReservationAdapter;
pub use spu::SpuAdapter;
