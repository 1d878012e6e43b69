/// IGNB format: Ignition startup-program bundle (.ignb)
///
/// Layout:
/// [4 bytes] Magic: "IGNB"
/// [4 bytes] Manifest length (u32 LE)
/// [N bytes] JSON manifest
/// [4 bytes] Payload length (u32 LE)
/// [remaining] JSON-serialized StartupProgram

use crate::ir::StartupProgram;
use std::io::{self, Read, Write};

const MAGIC: &[u8; 4] = b"IGNB";

/// Serialize a StartupProgram to the .ignb binary format.
pub fn write_bundle<W: Write>(writer: &mut W, program: &StartupProgram) -> io::Result<()> {
    // 1. Magic number
    writer.write_all(MAGIC)?;

    // 2. JSON manifest
    let manifest = serde_json::json!({
        "name": program.name,
        "version": program.version,
        "methods": program.methods.len(),
        "array_size": program.array_size,
        "format": "ignition-startup-v1",
    });
    let manifest_bytes = serde_json::to_vec(&manifest)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    let manifest_len = manifest_bytes.len() as u32;
    writer.write_all(&manifest_len.to_le_bytes())?;
    writer.write_all(&manifest_bytes)?;

    // 3. Program payload as JSON (simple, portable)
    let payload = serde_json::to_vec(program)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    let payload_len = payload.len() as u32;
    writer.write_all(&payload_len.to_le_bytes())?;
    writer.write_all(&payload)?;

    Ok(())
}

/// Deserialize a StartupProgram from .ignb binary format.
pub fn read_bundle<R: Read>(reader: &mut R) -> io::Result<StartupProgram> {
    // 1. Validate magic
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Invalid magic number: expected IGNB, got {:?}", magic),
        ));
    }

    // 2. Read manifest
    let mut manifest_len_bytes = [0u8; 4];
    reader.read_exact(&mut manifest_len_bytes)?;
    let manifest_len = u32::from_le_bytes(manifest_len_bytes) as usize;
    let mut manifest_bytes = vec![0u8; manifest_len];
    reader.read_exact(&mut manifest_bytes)?;
    // Manifest is informational; we don't strictly need it to run.

    // 3. Read payload
    let mut payload_len_bytes = [0u8; 4];
    reader.read_exact(&mut payload_len_bytes)?;
    let payload_len = u32::from_le_bytes(payload_len_bytes) as usize;
    let mut payload = vec![0u8; payload_len];
    reader.read_exact(&mut payload)?;

    let program: StartupProgram = serde_json::from_slice(&payload)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    Ok(program)
}

/// Read just the JSON manifest for inspection tools.
pub fn read_manifest<R: Read>(reader: &mut R) -> io::Result<serde_json::Value> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "not an .ignb bundle"));
    }
    let mut manifest_len_bytes = [0u8; 4];
    reader.read_exact(&mut manifest_len_bytes)?;
    let manifest_len = u32::from_le_bytes(manifest_len_bytes) as usize;
    let mut manifest_bytes = vec![0u8; manifest_len];
    reader.read_exact(&mut manifest_bytes)?;
    serde_json::from_slice(&manifest_bytes)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Instruction, Opcode, StartupMethod};

    fn tiny_program() -> StartupProgram {
        let mut entry = StartupMethod::new("deploy".to_string());
        entry.emit(Instruction::a_only(Opcode::ReturnVoid, 0));
        entry.locals = 1;
        let mut factory = StartupMethod::new("$create_array".to_string());
        factory.emit(Instruction::ab(Opcode::NewSharedArray, 0, 0));
        factory.emit(Instruction::a_only(Opcode::Return, 0));
        factory.locals = 1;
        StartupProgram {
            name: "ignition.generated.test$run0".to_string(),
            version: "0.1.0".to_string(),
            entry,
            methods: vec![factory],
            array_factory: 0,
            array_size: 0,
        }
    }

    #[test]
    fn test_bundle_roundtrip() {
        let program = tiny_program();
        let mut buf = Vec::new();
        write_bundle(&mut buf, &program).unwrap();

        let restored = read_bundle(&mut buf.as_slice()).unwrap();
        assert_eq!(restored.name, program.name);
        assert_eq!(restored.methods.len(), 1);
        assert_eq!(restored.entry.instructions.len(), 1);
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let mut buf = Vec::new();
        write_bundle(&mut buf, &tiny_program()).unwrap();
        buf[0] = b'X';
        assert!(read_bundle(&mut buf.as_slice()).is_err());
    }

    #[test]
    fn test_manifest_is_readable_alone() {
        let mut buf = Vec::new();
        write_bundle(&mut buf, &tiny_program()).unwrap();
        let manifest = read_manifest(&mut buf.as_slice()).unwrap();
        assert_eq!(manifest["format"], "ignition-startup-v1");
        assert_eq!(manifest["methods"], 1);
    }
}
