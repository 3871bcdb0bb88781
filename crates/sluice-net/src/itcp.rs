use std::io::{self, Read, Write};

/// Longest preamble an itcp peer may send before we give up on it.
const PREAMBLE_CAP: usize = 1024;

/// Send the itcp identification preamble: `key: value` lines closed by an
/// empty line. Only the transfer id is carried today.
pub fn write_preamble<W: Write>(w: &mut W, id: &str) -> io::Result<()> {
    write!(w, "id: {id}\n\n")
}

/// Read the preamble from a fresh itcp connection, returning its key/value
/// pairs. Everything after the empty line is sample data and stays in the
/// stream.
pub fn read_preamble<R: Read>(r: &mut R) -> io::Result<Vec<(String, String)>> {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    while !raw.ends_with(b"\n\n") {
        if raw.len() >= PREAMBLE_CAP {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "itcp preamble exceeds 1024 bytes",
            ));
        }
        match r.read(&mut byte)? {
            0 => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed inside itcp preamble",
                ));
            }
            _ => raw.push(byte[0]),
        }
    }

    let text = str::from_utf8(&raw)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "itcp preamble not utf-8"))?;
    Ok(text
        .lines()
        .filter_map(|line| {
            let (k, v) = line.split_once(':')?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn preamble_round_trip_leaves_data_in_stream() {
        let mut wire = Vec::new();
        write_preamble(&mut wire, "transfer-42").unwrap();
        wire.extend_from_slice(b"sampledata");

        let mut cursor = io::Cursor::new(wire);
        let fields = read_preamble(&mut cursor).unwrap();
        assert_eq!(fields, vec![("id".to_string(), "transfer-42".to_string())]);

        let mut rest = String::new();
        cursor.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "sampledata");
    }

    #[test]
    fn truncated_preamble_errors() {
        let mut cursor = io::Cursor::new(b"id: x\n".to_vec());
        let err = read_preamble(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
