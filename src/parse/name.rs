//! The `name` custom section, parsed for diagnostics only.
//!
//! <https://webassembly.github.io/spec/core/appendix/custom.html#name-section>

use crate::decode::Reader;
use crate::module::Names;
use crate::types::validate_utf8;

const SUBSEC_MODULE: u8 = 0;
const SUBSEC_FUNC: u8 = 1;

pub(crate) fn parse_name_section(mut r: Reader<'_>) -> crate::Result<Names> {
    let mut names = Names::default();
    let mut last_id: Option<u8> = None;
    while !r.is_empty() {
        let id = r.read_u8()?;
        if last_id.is_some_and(|last| id <= last) {
            // subsections must appear in order of increasing id
            return Err(crate::Error::malformed(r.pos(), "out of order subsection"));
        }
        last_id = Some(id);
        let size = r.read_leb_u32()? as usize;
        let mut sub = r.slice(size)?;
        r.skip(size)?;
        match id {
            SUBSEC_MODULE => {
                let len = sub.read_leb_u32()? as usize;
                let offset = sub.pos();
                names.module_name = Some(validate_utf8(sub.read_bytes(len)?, offset)?);
            }
            SUBSEC_FUNC => {
                let count = sub.read_leb_u32()?;
                let mut prev: Option<u32> = None;
                for _ in 0..count {
                    let idx = sub.read_leb_u32()?;
                    if prev.is_some_and(|p| idx <= p) {
                        return Err(crate::Error::malformed(sub.pos(), "out of order name map"));
                    }
                    prev = Some(idx);
                    let len = sub.read_leb_u32()? as usize;
                    let offset = sub.pos();
                    let name = validate_utf8(sub.read_bytes(len)?, offset)?;
                    names.func_names.push((idx, name));
                }
            }
            // local names and the extended-name-section ids carry nothing
            // we use; skip them
            _ => {}
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn func_names_sorted_lookup() {
        // module name subsection; then two function names
        let mut bytes = Vec::new();
        bytes.push(SUBSEC_MODULE);
        bytes.push(3); // subsection size
        bytes.extend_from_slice(&[2, b'h', b'i']);
        bytes.push(SUBSEC_FUNC);
        let body = [2u8, 0, 1, b'a', 3, 3, b'x', b'y', b'z'];
        bytes.push(u8::try_from(body.len()).unwrap());
        bytes.extend_from_slice(&body);
        let names = parse_name_section(Reader::new(&bytes)).unwrap();
        assert_eq!(names.module_name.as_deref(), Some("hi"));
        assert_eq!(
            names.func_name(crate::indices::FuncIdx::from_u32(3)),
            Some("xyz")
        );
        assert_eq!(names.func_name(crate::indices::FuncIdx::from_u32(1)), None);
    }

    #[test]
    fn out_of_order_map_is_rejected() {
        let bytes = [SUBSEC_FUNC, 5, 2, 1, 1, b'a', 0];
        assert!(parse_name_section(Reader::new(&bytes)).is_err());
    }
}
