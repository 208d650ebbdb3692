//! Self-delimited record IO.
//!
//! A [`UnitIo`] reads, writes, skips, or logically deletes one unit at the
//! current position of a seekable byte stream. Records are self-delimiting:
//! the leading type id byte selects the piece table, and every piece carries
//! either a declared fixed width or a length prefix. Logical deletion
//! overwrites a record in place while preserving its size, so the stream
//! remains traversable.
//!
//! Deleted-record wire format: a one-byte record becomes `0x00`; any longer
//! record becomes `0x01`, a run of `0x01`, and a terminating `0x00`. The run
//! is located by reading boolean bytes until the first `false`.

use std::io::{Read, Seek, SeekFrom, Write};

use smallvec::SmallVec;

use crate::datadef::{Value, Width};
use crate::error::{InvalidValue, StorageError, UnitDataFormat};
use crate::unit::{ArfSpec, Unit, UnitTypeId};

/// Pieces produced by a selective read, in selection order.
pub type Pieces = SmallVec<[Value; 4]>;

pub struct UnitIo<'a> {
    spec: &'a ArfSpec,
}

impl<'a> UnitIo<'a> {
    pub fn new(spec: &'a ArfSpec) -> Self {
        UnitIo { spec }
    }

    /// Decode the record at the cursor.
    ///
    /// Returns `None` for a logically deleted record; the cursor still
    /// advances past it. With `select`, only the pieces at the given indices
    /// are decoded and returned (in selection order); all other pieces are
    /// seeked over using their declared widths. Without `select`, all pieces
    /// are returned.
    pub fn read_next<R: Read + Seek>(
        &self,
        stream: &mut R,
        select: Option<&[usize]>,
    ) -> Result<Option<Pieces>, StorageError> {
        let typeid = UnitTypeId(read_byte(stream)?);
        if typeid.is_deleted_marker() {
            self.skip_deleted(stream, typeid.0)?;
            return Ok(None);
        }
        let ut = self
            .spec
            .lookup(typeid)
            .ok_or(UnitDataFormat::UnknownTypeId(typeid.0))?;

        let wanted = |idx: usize| select.is_none_or(|sel| sel.contains(&idx));
        let mut picked: SmallVec<[(usize, Value); 4]> = SmallVec::new();
        if wanted(0) {
            picked.push((0, Value::Int(typeid.0 as u64)));
        }
        for idx in 1..ut.piece_count() {
            let def = &ut.piece_def(idx).expect("index in range").def;
            match def.width() {
                Width::Fixed(len) => {
                    if wanted(idx) {
                        let buf = read_vec(stream, len)?;
                        let (v, _) = def.unpack(&buf)?;
                        picked.push((idx, v));
                    } else {
                        stream.seek(SeekFrom::Current(len as i64))?;
                    }
                }
                Width::Variable(len_def) => {
                    let Width::Fixed(prefix_len) = len_def.width() else {
                        unreachable!("length prefixes have fixed width");
                    };
                    let prefix = read_vec(stream, prefix_len)?;
                    let (len_v, _) = len_def.unpack(&prefix)?;
                    let len = len_v.as_int().unwrap_or_default() as usize;
                    if wanted(idx) {
                        let payload = read_vec(stream, len)?;
                        picked.push((idx, Value::Bytes(payload)));
                    } else {
                        stream.seek(SeekFrom::Current(len as i64))?;
                    }
                }
            }
        }

        let pieces = match select {
            None => picked.into_iter().map(|(_, v)| v).collect(),
            Some(sel) => sel
                .iter()
                .filter_map(|i| picked.iter().find(|(idx, _)| idx == i))
                .map(|(_, v)| v.clone())
                .collect(),
        };
        Ok(Some(pieces))
    }

    /// Like [`Self::read_next`] without a selection, reassembled as a [`Unit`].
    pub fn read_next_unit<R: Read + Seek>(
        &self,
        stream: &mut R,
    ) -> Result<Option<Unit>, StorageError> {
        Ok(self.read_next(stream, None)?.map(Unit::from_pieces))
    }

    /// Advance the cursor past the record without decoding payload pieces.
    ///
    /// Returns `None` if the record is logically deleted.
    pub fn skip_next<R: Read + Seek>(&self, stream: &mut R) -> Result<Option<()>, StorageError> {
        Ok(self.read_next(stream, Some(&[]))?.map(|_| ()))
    }

    /// Encode `unit` at the cursor. Returns the record's size in bytes.
    ///
    /// All pieces are validated and encoded before anything is written.
    pub fn write_unit<W: Write>(&self, stream: &mut W, unit: &Unit) -> Result<usize, StorageError> {
        let typeid = unit.typeid();
        let ut = self
            .spec
            .lookup(typeid)
            .ok_or(UnitDataFormat::UnknownTypeId(typeid.0))?;
        if unit.pieces().len() != ut.piece_count() {
            return Err(InvalidValue::PieceCount {
                typeid,
                expected: ut.piece_count() - 1,
                got: unit.pieces().len() - 1,
            }
            .into());
        }
        let mut buf = Vec::new();
        for (idx, value) in unit.pieces().iter().enumerate() {
            let def = &ut.piece_def(idx).expect("count checked").def;
            def.pack(value, &mut buf)?;
        }
        stream.write_all(&buf)?;
        Ok(buf.len())
    }

    /// Logically delete the record at the cursor, preserving its size.
    ///
    /// Deleting an already-deleted record is a no-op. On return the cursor
    /// sits at the end of the record, as with every other operation.
    pub fn delete_next<S: Read + Write + Seek>(&self, stream: &mut S) -> Result<(), StorageError> {
        let start = stream.stream_position()?;
        let live = self.skip_next(stream)?;
        if live.is_none() {
            return Ok(());
        }
        let end = stream.stream_position()?;
        let len = (end - start) as usize;

        stream.seek(SeekFrom::Start(start))?;
        let mut pattern = vec![0x01u8; len];
        *pattern.last_mut().expect("records are non-empty") = 0x00;
        if len == 1 {
            pattern[0] = 0x00;
        }
        stream.write_all(&pattern)?;
        Ok(())
    }

    /// Consume the remainder of a deleted record whose type id byte was
    /// already read.
    fn skip_deleted<R: Read>(&self, stream: &mut R, marker: u8) -> Result<(), StorageError> {
        if marker == 0x00 {
            return Ok(());
        }
        loop {
            match read_byte(stream)? {
                0x01 => continue,
                0x00 => return Ok(()),
                other => return Err(UnitDataFormat::InvalidBool(other).into()),
            }
        }
    }
}

fn read_byte<R: Read>(stream: &mut R) -> Result<u8, StorageError> {
    let mut buf = [0u8; 1];
    read_exact_counted(stream, &mut buf)?;
    Ok(buf[0])
}

fn read_vec<R: Read>(stream: &mut R, len: usize) -> Result<Vec<u8>, StorageError> {
    let mut buf = vec![0u8; len];
    read_exact_counted(stream, &mut buf)?;
    Ok(buf)
}

fn read_exact_counted<R: Read>(stream: &mut R, buf: &mut [u8]) -> Result<(), StorageError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..])?;
        if n == 0 {
            return Err(UnitDataFormat::Truncated {
                wanted: buf.len() - filled,
            }
            .into());
        }
        filled += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::unit::builtin;

    fn io_over(spec: &ArfSpec) -> UnitIo<'_> {
        UnitIo::new(spec)
    }

    #[test]
    fn strand_write_wire_form() {
        let spec = ArfSpec::base();
        let io = io_over(&spec);
        let mut stream = Cursor::new(Vec::new());
        io.write_unit(&mut stream, &builtin::strand_write(4096, vec![1, 2, 3]))
            .unwrap();
        assert_eq!(
            stream.get_ref().as_slice(),
            &[0x06, 0x00, 0x10, 0, 0, 0, 0, 0, 0, 0x03, 0x00, 1, 2, 3]
        );

        stream.set_position(0);
        let unit = io.read_next_unit(&mut stream).unwrap().unwrap();
        assert_eq!(
            unit.pieces(),
            &[
                Value::Int(6),
                Value::Int(4096),
                Value::Bytes(vec![1, 2, 3])
            ]
        );
    }

    #[test]
    fn selective_read_seeks_over_unselected() {
        let spec = ArfSpec::base();
        let io = io_over(&spec);
        let mut stream = Cursor::new(Vec::new());
        io.write_unit(&mut stream, &builtin::strand_write(7, vec![9; 100]))
            .unwrap();
        io.write_unit(&mut stream, &builtin::strand_create(55))
            .unwrap();

        stream.set_position(0);
        // Select offset only; the 100-byte data piece is skipped, and the
        // next record still decodes from the right position.
        let pieces = io.read_next(&mut stream, Some(&[1])).unwrap().unwrap();
        assert_eq!(pieces.as_slice(), &[Value::Int(7)]);
        let unit = io.read_next_unit(&mut stream).unwrap().unwrap();
        assert_eq!(unit.typeid(), builtin::STRAND_CREATE);
    }

    #[test]
    fn selection_order_is_preserved() {
        let spec = ArfSpec::base();
        let io = io_over(&spec);
        let mut stream = Cursor::new(Vec::new());
        io.write_unit(&mut stream, &builtin::strand_group_select(96, 5))
            .unwrap();
        stream.set_position(0);
        let pieces = io.read_next(&mut stream, Some(&[2, 1])).unwrap().unwrap();
        assert_eq!(pieces.as_slice(), &[Value::Int(5), Value::Int(96)]);
    }

    #[test]
    fn delete_preserves_record_size() {
        let spec = ArfSpec::base();
        let io = io_over(&spec);
        let mut stream = Cursor::new(Vec::new());
        let first_len = io
            .write_unit(&mut stream, &builtin::strand_create(10))
            .unwrap();
        io.write_unit(&mut stream, &builtin::strand_write(0, b"abc".to_vec()))
            .unwrap();
        let total = stream.get_ref().len();

        stream.set_position(0);
        io.delete_next(&mut stream).unwrap();
        assert_eq!(stream.position(), first_len as u64);
        assert_eq!(stream.get_ref().len(), total);
        // 0x01 run terminated by 0x00, same size as the create record.
        assert_eq!(&stream.get_ref()[..first_len], &[1, 1, 1, 1, 1, 1, 1, 1, 0]);

        stream.set_position(0);
        assert_eq!(io.read_next(&mut stream, None).unwrap(), None);
        let unit = io.read_next_unit(&mut stream).unwrap().unwrap();
        assert_eq!(unit.typeid(), builtin::STRAND_WRITE);
        assert_eq!(unit.piece(2), Some(&Value::Bytes(b"abc".to_vec())));
    }

    #[test]
    fn delete_single_byte_record() {
        let spec = ArfSpec::base();
        let io = io_over(&spec);
        let mut stream = Cursor::new(Vec::new());
        io.write_unit(&mut stream, &builtin::strand_discard())
            .unwrap();
        stream.set_position(0);
        io.delete_next(&mut stream).unwrap();
        assert_eq!(stream.get_ref().as_slice(), &[0x00]);

        stream.set_position(0);
        assert_eq!(io.skip_next(&mut stream).unwrap(), None);
    }

    #[test]
    fn delete_is_idempotent() {
        let spec = ArfSpec::base();
        let io = io_over(&spec);
        let mut stream = Cursor::new(Vec::new());
        io.write_unit(&mut stream, &builtin::strand_select(3))
            .unwrap();
        let snapshot = {
            stream.set_position(0);
            io.delete_next(&mut stream).unwrap();
            stream.get_ref().clone()
        };
        stream.set_position(0);
        io.delete_next(&mut stream).unwrap();
        assert_eq!(stream.get_ref(), &snapshot);
    }

    #[test]
    fn unknown_typeid_is_rejected() {
        let spec = ArfSpec::base();
        let io = io_over(&spec);
        let mut stream = Cursor::new(vec![0x7fu8]);
        let err = io.read_next(&mut stream, None).unwrap_err();
        assert!(matches!(
            err,
            StorageError::Format(UnitDataFormat::UnknownTypeId(0x7f))
        ));
    }

    #[test]
    fn truncated_record_reports_missing_bytes() {
        let spec = ArfSpec::base();
        let io = io_over(&spec);
        // strand_create wants eight payload bytes; give it three.
        let mut stream = Cursor::new(vec![0x07, 1, 2, 3]);
        let err = io.read_next(&mut stream, None).unwrap_err();
        assert!(matches!(
            err,
            StorageError::Format(UnitDataFormat::Truncated { wanted: 5 })
        ));
    }
}
