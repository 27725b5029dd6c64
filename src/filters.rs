
//! The image-decoder contract.
//!
//! Decoders themselves live outside this crate; the host registers one
//! entry per format, each with a non-consuming signature test and a
//! factory that layers the decode filter over a byte source. The context
//! layer here only dispatches: peek at the stream, ask each format in
//! registration order, hand the stream to the first taker.

use crate::error::{Error, Result};
use crate::io::Read;


/// The keyword parameters a decode filter understands. Formats ignore
/// the ones that do not apply to them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterParams {
    pub columns: Option<i32>,
    pub rows: Option<i32>,

    /// CCITT encoding scheme selector.
    pub k: Option<i32>,

    pub bits_per_component: Option<i32>,
    pub colors: Option<i32>,

    /// CCITT end-of-block expectation.
    pub end_of_block: Option<bool>,
}

/// One registered image format.
pub trait ImageFilter {

    /// Short format name, e.g. `"PNG"`.
    fn name(&self) -> &'static str;

    /// Whether the first bytes of a stream look like this format.
    /// Must not consume the stream; the dispatcher hands over a copy of
    /// the stream head.
    fn signature_test(&self, head: &[u8]) -> bool;

    /// Layer the decode filter over a source.
    fn make_filter<'s>(
        &self, source: Box<dyn Read + 's>, params: &FilterParams,
    ) -> Result<Box<dyn Read + 's>>;
}

/// The registered formats, asked in registration order.
#[derive(Default)]
pub struct FilterRegistry {
    filters: Vec<Box<dyn ImageFilter>>,
}

impl std::fmt::Debug for FilterRegistry {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_list()
            .entries(self.filters.iter().map(|filter| filter.name()))
            .finish()
    }
}

impl FilterRegistry {

    pub fn new() -> Self { Self::default() }

    pub fn register(&mut self, filter: Box<dyn ImageFilter>) {
        self.filters.push(filter);
    }

    /// The first format whose signature matches the stream head.
    pub fn identify(&self, head: &[u8]) -> Option<&dyn ImageFilter> {
        self.filters.iter()
            .map(AsRef::as_ref)
            .find(|filter| filter.signature_test(head))
    }

    /// Identify a stream and layer the matching decode filter over it.
    pub fn dispatch<'s>(
        &self, head: &[u8], source: Box<dyn Read + 's>, params: &FilterParams,
    ) -> Result<Box<dyn Read + 's>> {
        match self.identify(head) {
            Some(filter) => filter.make_filter(source, params),
            None => Err(Error::unsupported("image data matches no registered format")),
        }
    }
}


#[cfg(test)]
mod test {
    use super::*;

    struct Png;
    impl ImageFilter for Png {
        fn name(&self) -> &'static str { "PNG" }

        fn signature_test(&self, head: &[u8]) -> bool {
            head.starts_with(b"\x89PNG\r\n\x1a\n")
        }

        fn make_filter<'s>(
            &self, source: Box<dyn Read + 's>, _params: &FilterParams,
        ) -> Result<Box<dyn Read + 's>> {
            Ok(source)
        }
    }

    struct Jfif;
    impl ImageFilter for Jfif {
        fn name(&self) -> &'static str { "JFIF" }

        fn signature_test(&self, head: &[u8]) -> bool {
            head.starts_with(&[0xff, 0xd8])
        }

        fn make_filter<'s>(
            &self, source: Box<dyn Read + 's>, _params: &FilterParams,
        ) -> Result<Box<dyn Read + 's>> {
            Ok(source)
        }
    }

    #[test]
    fn dispatch_by_signature(){
        let mut registry = FilterRegistry::new();
        registry.register(Box::new(Png));
        registry.register(Box::new(Jfif));

        assert_eq!(registry.identify(b"\x89PNG\r\n\x1a\nrest").unwrap().name(), "PNG");
        assert_eq!(registry.identify(&[0xff, 0xd8, 0xff, 0xe0]).unwrap().name(), "JFIF");
        assert!(registry.identify(b"GIF89a").is_none());

        let source: &[u8] = &[0xff, 0xd8, 1, 2, 3];
        let mut filtered = registry.dispatch(
            &source[.. 2], Box::new(source), &FilterParams::default(),
        ).unwrap();

        let mut bytes = Vec::new();
        filtered.read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, [0xff, 0xd8, 1, 2, 3]);
    }
}
