pub mod coding;
pub mod comparator;
pub mod crc32;
pub mod hash;
pub mod random;
