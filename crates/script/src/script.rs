//! Opcode constants and script scanning helpers.

use emberd_consensus::constants::REF_ID_SIZE;

use crate::error::ScriptError;

/// A 36-byte reference identifier carried by the push-reference opcodes.
/// An id minted from an outpoint is the serialized outpoint itself
/// (txid followed by the little-endian output index).
pub type RefId = [u8; REF_ID_SIZE];

// Push value
pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_RESERVED: u8 = 0x50;
pub const OP_1: u8 = 0x51;
pub const OP_2: u8 = 0x52;
pub const OP_3: u8 = 0x53;
pub const OP_4: u8 = 0x54;
pub const OP_5: u8 = 0x55;
pub const OP_6: u8 = 0x56;
pub const OP_7: u8 = 0x57;
pub const OP_8: u8 = 0x58;
pub const OP_9: u8 = 0x59;
pub const OP_10: u8 = 0x5a;
pub const OP_11: u8 = 0x5b;
pub const OP_12: u8 = 0x5c;
pub const OP_13: u8 = 0x5d;
pub const OP_14: u8 = 0x5e;
pub const OP_15: u8 = 0x5f;
pub const OP_16: u8 = 0x60;

// Control
pub const OP_NOP: u8 = 0x61;
pub const OP_VER: u8 = 0x62;
pub const OP_IF: u8 = 0x63;
pub const OP_NOTIF: u8 = 0x64;
pub const OP_VERIF: u8 = 0x65;
pub const OP_VERNOTIF: u8 = 0x66;
pub const OP_ELSE: u8 = 0x67;
pub const OP_ENDIF: u8 = 0x68;
pub const OP_VERIFY: u8 = 0x69;
pub const OP_RETURN: u8 = 0x6a;

// Stack ops
pub const OP_TOALTSTACK: u8 = 0x6b;
pub const OP_FROMALTSTACK: u8 = 0x6c;
pub const OP_2DROP: u8 = 0x6d;
pub const OP_2DUP: u8 = 0x6e;
pub const OP_3DUP: u8 = 0x6f;
pub const OP_2OVER: u8 = 0x70;
pub const OP_2ROT: u8 = 0x71;
pub const OP_2SWAP: u8 = 0x72;
pub const OP_IFDUP: u8 = 0x73;
pub const OP_DEPTH: u8 = 0x74;
pub const OP_DROP: u8 = 0x75;
pub const OP_DUP: u8 = 0x76;
pub const OP_NIP: u8 = 0x77;
pub const OP_OVER: u8 = 0x78;
pub const OP_PICK: u8 = 0x79;
pub const OP_ROLL: u8 = 0x7a;
pub const OP_ROT: u8 = 0x7b;
pub const OP_SWAP: u8 = 0x7c;
pub const OP_TUCK: u8 = 0x7d;

// Splice ops
pub const OP_CAT: u8 = 0x7e;
pub const OP_SPLIT: u8 = 0x7f;
pub const OP_NUM2BIN: u8 = 0x80;
pub const OP_BIN2NUM: u8 = 0x81;
pub const OP_SIZE: u8 = 0x82;

// Bit logic
pub const OP_INVERT: u8 = 0x83;
pub const OP_AND: u8 = 0x84;
pub const OP_OR: u8 = 0x85;
pub const OP_XOR: u8 = 0x86;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_RESERVED1: u8 = 0x89;
pub const OP_RESERVED2: u8 = 0x8a;

// Numeric
pub const OP_1ADD: u8 = 0x8b;
pub const OP_1SUB: u8 = 0x8c;
pub const OP_2MUL: u8 = 0x8d;
pub const OP_2DIV: u8 = 0x8e;
pub const OP_NEGATE: u8 = 0x8f;
pub const OP_ABS: u8 = 0x90;
pub const OP_NOT: u8 = 0x91;
pub const OP_0NOTEQUAL: u8 = 0x92;
pub const OP_ADD: u8 = 0x93;
pub const OP_SUB: u8 = 0x94;
pub const OP_MUL: u8 = 0x95;
pub const OP_DIV: u8 = 0x96;
pub const OP_MOD: u8 = 0x97;
pub const OP_LSHIFT: u8 = 0x98;
pub const OP_RSHIFT: u8 = 0x99;
pub const OP_BOOLAND: u8 = 0x9a;
pub const OP_BOOLOR: u8 = 0x9b;
pub const OP_NUMEQUAL: u8 = 0x9c;
pub const OP_NUMEQUALVERIFY: u8 = 0x9d;
pub const OP_NUMNOTEQUAL: u8 = 0x9e;
pub const OP_LESSTHAN: u8 = 0x9f;
pub const OP_GREATERTHAN: u8 = 0xa0;
pub const OP_LESSTHANOREQUAL: u8 = 0xa1;
pub const OP_GREATERTHANOREQUAL: u8 = 0xa2;
pub const OP_MIN: u8 = 0xa3;
pub const OP_MAX: u8 = 0xa4;
pub const OP_WITHIN: u8 = 0xa5;

// Crypto
pub const OP_RIPEMD160: u8 = 0xa6;
pub const OP_SHA1: u8 = 0xa7;
pub const OP_SHA256: u8 = 0xa8;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_HASH256: u8 = 0xaa;
pub const OP_CODESEPARATOR: u8 = 0xab;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

// Expansion
pub const OP_NOP1: u8 = 0xb0;
pub const OP_CHECKLOCKTIMEVERIFY: u8 = 0xb1;
pub const OP_CHECKSEQUENCEVERIFY: u8 = 0xb2;
pub const OP_NOP4: u8 = 0xb3;
pub const OP_NOP10: u8 = 0xb9;

// More crypto
pub const OP_CHECKDATASIG: u8 = 0xba;
pub const OP_CHECKDATASIGVERIFY: u8 = 0xbb;

// Additional byte string operations
pub const OP_REVERSEBYTES: u8 = 0xbc;

// State separators
pub const OP_STATESEPARATOR: u8 = 0xbd;
pub const OP_STATESEPARATORINDEX_UTXO: u8 = 0xbe;
pub const OP_STATESEPARATORINDEX_OUTPUT: u8 = 0xbf;

// Native introspection
pub const OP_INPUTINDEX: u8 = 0xc0;
pub const OP_ACTIVEBYTECODE: u8 = 0xc1;
pub const OP_TXVERSION: u8 = 0xc2;
pub const OP_TXINPUTCOUNT: u8 = 0xc3;
pub const OP_TXOUTPUTCOUNT: u8 = 0xc4;
pub const OP_TXLOCKTIME: u8 = 0xc5;
pub const OP_UTXOVALUE: u8 = 0xc6;
pub const OP_UTXOBYTECODE: u8 = 0xc7;
pub const OP_OUTPOINTTXHASH: u8 = 0xc8;
pub const OP_OUTPOINTINDEX: u8 = 0xc9;
pub const OP_INPUTBYTECODE: u8 = 0xca;
pub const OP_INPUTSEQUENCENUMBER: u8 = 0xcb;
pub const OP_OUTPUTVALUE: u8 = 0xcc;
pub const OP_OUTPUTBYTECODE: u8 = 0xcd;
pub const OP_RESERVED3: u8 = 0xce;
pub const OP_RESERVED4: u8 = 0xcf;

// Reference opcodes
pub const OP_PUSHINPUTREF: u8 = 0xd0;
pub const OP_REQUIREINPUTREF: u8 = 0xd1;
pub const OP_DISALLOWPUSHINPUTREF: u8 = 0xd2;
pub const OP_DISALLOWPUSHINPUTREFSIBLING: u8 = 0xd3;
pub const OP_REFHASHDATASUMMARY_UTXO: u8 = 0xd4;
pub const OP_REFHASHVALUESUM_UTXOS: u8 = 0xd5;
pub const OP_REFHASHDATASUMMARY_OUTPUT: u8 = 0xd6;
pub const OP_REFHASHVALUESUM_OUTPUTS: u8 = 0xd7;
pub const OP_PUSHINPUTREFSINGLETON: u8 = 0xd8;
pub const OP_REFTYPE_UTXO: u8 = 0xd9;
pub const OP_REFTYPE_OUTPUT: u8 = 0xda;
pub const OP_REFVALUESUM_UTXOS: u8 = 0xdb;
pub const OP_REFVALUESUM_OUTPUTS: u8 = 0xdc;
pub const OP_REFOUTPUTCOUNT_UTXOS: u8 = 0xdd;
pub const OP_REFOUTPUTCOUNT_OUTPUTS: u8 = 0xde;
pub const OP_REFOUTPUTCOUNTZEROVALUED_UTXOS: u8 = 0xdf;
pub const OP_REFOUTPUTCOUNTZEROVALUED_OUTPUTS: u8 = 0xe0;
pub const OP_REFDATASUMMARY_UTXO: u8 = 0xe1;
pub const OP_REFDATASUMMARY_OUTPUT: u8 = 0xe2;
pub const OP_CODESCRIPTHASHVALUESUM_UTXOS: u8 = 0xe3;
pub const OP_CODESCRIPTHASHVALUESUM_OUTPUTS: u8 = 0xe4;
pub const OP_CODESCRIPTHASHOUTPUTCOUNT_UTXOS: u8 = 0xe5;
pub const OP_CODESCRIPTHASHOUTPUTCOUNT_OUTPUTS: u8 = 0xe6;
pub const OP_CODESCRIPTHASHZEROVALUEDOUTPUTCOUNT_UTXOS: u8 = 0xe7;
pub const OP_CODESCRIPTHASHZEROVALUEDOUTPUTCOUNT_OUTPUTS: u8 = 0xe8;
pub const OP_CODESCRIPTBYTECODE_UTXO: u8 = 0xe9;
pub const OP_CODESCRIPTBYTECODE_OUTPUT: u8 = 0xea;
pub const OP_STATESCRIPTBYTECODE_UTXO: u8 = 0xeb;
pub const OP_STATESCRIPTBYTECODE_OUTPUT: u8 = 0xec;
pub const OP_PUSH_TX_STATE: u8 = 0xed;

/// One decoded script operation: the opcode and, for pushes, its operand.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Op<'a> {
    pub opcode: u8,
    pub push: Option<&'a [u8]>,
}

/// Reads the operation at `*cursor`, advancing the cursor past it.
/// A truncated push is a malformed script.
pub fn next_op<'a>(script: &'a [u8], cursor: &mut usize) -> Result<Op<'a>, ScriptError> {
    let opcode = *script.get(*cursor).ok_or(ScriptError::BadOpcode)?;
    *cursor += 1;

    let len = match opcode {
        0x01..=0x4b => opcode as usize,
        OP_PUSHDATA1 => {
            let len = *script.get(*cursor).ok_or(ScriptError::BadOpcode)? as usize;
            *cursor += 1;
            len
        }
        OP_PUSHDATA2 => {
            let bytes = script
                .get(*cursor..*cursor + 2)
                .ok_or(ScriptError::BadOpcode)?;
            *cursor += 2;
            u16::from_le_bytes([bytes[0], bytes[1]]) as usize
        }
        OP_PUSHDATA4 => {
            let bytes = script
                .get(*cursor..*cursor + 4)
                .ok_or(ScriptError::BadOpcode)?;
            *cursor += 4;
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
        }
        // The reference declarations carry their 36-byte operand inline.
        OP_PUSHINPUTREF
        | OP_REQUIREINPUTREF
        | OP_DISALLOWPUSHINPUTREF
        | OP_DISALLOWPUSHINPUTREFSIBLING
        | OP_PUSHINPUTREFSINGLETON => REF_ID_SIZE,
        _ => return Ok(Op { opcode, push: None }),
    };

    let data = script
        .get(*cursor..*cursor + len)
        .ok_or(match opcode {
            OP_PUSHINPUTREF
            | OP_REQUIREINPUTREF
            | OP_DISALLOWPUSHINPUTREF
            | OP_DISALLOWPUSHINPUTREFSIBLING
            | OP_PUSHINPUTREFSINGLETON => ScriptError::InvalidTxRefSize,
            _ => ScriptError::BadOpcode,
        })?;
    *cursor += len;
    Ok(Op {
        opcode,
        push: Some(data),
    })
}

pub fn is_push_only(script: &[u8]) -> bool {
    let mut cursor = 0usize;
    while cursor < script.len() {
        match next_op(script, &mut cursor) {
            Ok(op) if op.opcode <= OP_16 => {}
            _ => return false,
        }
    }
    true
}

pub fn is_p2sh(script_pubkey: &[u8]) -> bool {
    script_pubkey.len() == 23
        && script_pubkey[0] == OP_HASH160
        && script_pubkey[1] == 0x14
        && script_pubkey[22] == OP_EQUAL
}

/// True when `opcode` was the shortest way to push `data`.
pub fn check_minimal_push(data: &[u8], opcode: u8) -> bool {
    if data.is_empty() {
        return opcode == OP_0;
    }
    if data.len() == 1 && (1..=16).contains(&data[0]) {
        return opcode == OP_1 + (data[0] - 1);
    }
    if data.len() == 1 && data[0] == 0x81 {
        return opcode == OP_1NEGATE;
    }
    if data.len() <= 75 {
        return opcode == data.len() as u8;
    }
    if data.len() <= 255 {
        return opcode == OP_PUSHDATA1;
    }
    if data.len() <= 65535 {
        return opcode == OP_PUSHDATA2;
    }
    true
}

/// The reference declarations found in one script.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ScriptRefs {
    pub push_refs: Vec<RefId>,
    pub require_refs: Vec<RefId>,
    pub singleton_refs: Vec<RefId>,
    pub disallowed_sibling_refs: Vec<RefId>,
}

impl ScriptRefs {
    pub fn is_empty(&self) -> bool {
        self.push_refs.is_empty()
            && self.require_refs.is_empty()
            && self.singleton_refs.is_empty()
            && self.disallowed_sibling_refs.is_empty()
    }

    /// All refs this script pushes or claims, singletons included.
    pub fn all_pushed(&self) -> impl Iterator<Item = &RefId> {
        self.push_refs.iter().chain(self.singleton_refs.iter())
    }
}

/// Scans a script for reference declarations. Fails on a malformed script
/// or a reference operand that is not exactly 36 bytes.
pub fn extract_refs(script: &[u8]) -> Result<ScriptRefs, ScriptError> {
    let mut refs = ScriptRefs::default();
    let mut cursor = 0usize;
    while cursor < script.len() {
        let op = next_op(script, &mut cursor)?;
        let target = match op.opcode {
            OP_PUSHINPUTREF | OP_DISALLOWPUSHINPUTREF => &mut refs.push_refs,
            OP_REQUIREINPUTREF => &mut refs.require_refs,
            OP_PUSHINPUTREFSINGLETON => &mut refs.singleton_refs,
            OP_DISALLOWPUSHINPUTREFSIBLING => &mut refs.disallowed_sibling_refs,
            _ => continue,
        };
        let data = op.push.ok_or(ScriptError::InvalidTxRefSize)?;
        let id: RefId = data.try_into().map_err(|_| ScriptError::InvalidTxRefSize)?;
        target.push(id);
    }
    Ok(refs)
}

/// Byte offset of the first byte after the first top-level
/// `OP_STATESEPARATOR`, or 0 when the script has none. The code script is
/// `script[offset..]`; the state script is everything before the
/// separator itself.
pub fn state_separator_offset(script: &[u8]) -> usize {
    let mut cursor = 0usize;
    while cursor < script.len() {
        match next_op(script, &mut cursor) {
            Ok(op) if op.opcode == OP_STATESEPARATOR => return cursor,
            Ok(_) => {}
            Err(_) => return 0,
        }
    }
    0
}

pub fn code_script(script: &[u8]) -> &[u8] {
    &script[state_separator_offset(script)..]
}

pub fn state_script(script: &[u8]) -> &[u8] {
    match state_separator_offset(script) {
        0 => &[],
        offset => &script[..offset - 1],
    }
}
