//! Tests for EH clause tables read from module images

use pretty_assertions::assert_eq;
use stackroots_core::eh::{encode_clause, ClauseHandler, EhClause, EhClauseKind, EhEnumState, TypeReference};
use stackroots_core::image::ModuleImage;
use stackroots_core::varint::encode_unsigned;
use stackroots_core::{Address, Architecture, WalkError};

const BASE: Address = Address::new(0x40_0000);
const METHOD: Address = Address::new(0x40_1000);
const EH_INFO: Address = Address::new(0x40_2000);
const TYPES: Address = Address::new(0x40_3000);

fn typed(try_start_offset: u32, try_end_offset: u32, handler_offset: u32) -> EhClause
{
    EhClause {
        try_start_offset,
        try_end_offset,
        handler: ClauseHandler::Typed {
            handler_offset,
            handler: Address::ZERO,
            target_type: Address::ZERO,
        },
    }
}

/// Type table entry 0 names a type directly; entry 1 goes through a cell at
/// 0x3100.
fn type_table() -> Vec<u8>
{
    let mut data = vec![0; 0x108];
    data[..8].copy_from_slice(&0x7700_0000_u64.to_le_bytes());
    data[8..16].copy_from_slice(&(TYPES.value() + 0x101).to_le_bytes());
    data[0x100..].copy_from_slice(&0x7700_0100_u64.to_le_bytes());
    data
}

fn image(table: Vec<u8>) -> ModuleImage
{
    ModuleImage::new(Architecture::Amd64, BASE)
        .with_section(".rdata", EH_INFO, table)
        .with_section(".data", TYPES, type_table())
}

fn type_index(index: u32) -> Vec<u8>
{
    let mut out = Vec::new();
    encode_unsigned(index, &mut out);
    out
}

#[test]
fn test_type_table_with_indirection_cells()
{
    let mut table = Vec::new();
    encode_unsigned(4, &mut table);
    encode_clause(&typed(0x10, 0x40, 0x80), &type_index(0), &mut table);
    encode_clause(&typed(0x18, 0x20, 0x90), &type_index(1), &mut table);
    let filter = EhClause {
        try_start_offset: 0x10,
        try_end_offset: 0x40,
        handler: ClauseHandler::Filter {
            handler_offset: 0xa0,
            handler: Address::ZERO,
            filter_offset: 0x98,
            filter: Address::ZERO,
        },
    };
    encode_clause(&filter, &[], &mut table);
    let fail_fast = EhClause {
        try_start_offset: 0,
        try_end_offset: 0x60,
        handler: ClauseHandler::FailFast,
    };
    encode_clause(&fail_fast, &[], &mut table);

    let image = image(table);
    let mut state = EhEnumState::new(&image, METHOD, EH_INFO, TypeReference::TypeTable { table: TYPES }).unwrap();
    assert_eq!(state.count(), 4);
    let clauses = state.collect_all(&image).unwrap();

    let targets: Vec<Option<Address>> = clauses
        .iter()
        .map(|clause| match clause.handler {
            ClauseHandler::Typed { target_type, .. } => Some(target_type),
            _ => None,
        })
        .collect();
    assert_eq!(
        targets,
        vec![Some(Address::new(0x7700_0000)), Some(Address::new(0x7700_0100)), None, None]
    );
    assert_eq!(
        clauses[2].handler,
        ClauseHandler::Filter {
            handler_offset: 0xa0,
            handler: METHOD + 0xa0,
            filter_offset: 0x98,
            filter: METHOD + 0x98,
        }
    );
    assert_eq!(clauses[3].kind(), EhClauseKind::FailFast);
    assert_eq!(clauses[3].handler_offset(), None);

    assert!(clauses[0].strictly_encloses(clauses[1].try_start_offset, clauses[1].try_end_offset));
    assert!(!clauses[2].strictly_encloses(clauses[0].try_start_offset, clauses[0].try_end_offset));
    assert!(clauses[3].strictly_encloses(0x10, 0x40));
    assert!(clauses[3].contains(0));
    assert!(!clauses[3].contains(0x60));

    assert_eq!(state.next(&image).unwrap(), None);
}

#[test]
fn test_fail_fast_needs_a_type_table()
{
    let mut table = Vec::new();
    encode_unsigned(1, &mut table);
    let fail_fast = EhClause {
        try_start_offset: 4,
        try_end_offset: 8,
        handler: ClauseHandler::FailFast,
    };
    encode_clause(&fail_fast, &[], &mut table);
    let image = image(table);

    let types = TypeReference::ModuleRva { module_base: BASE };
    let mut state = EhEnumState::new(&image, METHOD, EH_INFO, types).unwrap();
    let err = state.next(&image).unwrap_err();
    assert!(matches!(err, WalkError::MalformedGcInfo(_)));
    assert!(err.is_fatal());
}

#[test]
fn test_truncated_table()
{
    let mut table = Vec::new();
    encode_unsigned(2, &mut table);
    encode_clause(&typed(0x10, 0x40, 0x80), &type_index(0), &mut table);
    encode_unsigned(0x20, &mut table);
    let image = image(table);

    let mut state = EhEnumState::new(&image, METHOD, EH_INFO, TypeReference::TypeTable { table: TYPES }).unwrap();
    assert!(state.next(&image).unwrap().is_some());
    let err = state.next(&image).unwrap_err();
    assert!(matches!(err, WalkError::DecodeTruncated { .. }));

    let err = EhEnumState::new(&image, METHOD, BASE + 0x5000, TypeReference::SelfRelative).unwrap_err();
    assert!(matches!(err, WalkError::MemoryRead { .. }));
}
