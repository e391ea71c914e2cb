// Tue Feb 3 2026 - Alex

mod address;
mod error;
mod image;
mod owned;
mod pe;
mod section;

pub use address::Address;
pub use error::MemoryError;
pub use image::{
    data_sections, is_code_address, is_data_address, sections_at, ByteImage,
};
pub use owned::{OwnedImage, OwnedImageBuilder};
pub use pe::PeImage;
pub use section::{AddressRange, Section, SectionSemantics};
