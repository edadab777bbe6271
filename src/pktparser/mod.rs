/*   Copyright 2024 Perry Lorier
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 *
 *  SPDX-License-Identifier: Apache-2.0
 *
 *  Bounds checked cursor for picking apart packet headers.
 */

use std::convert::TryInto;

pub struct Buffer<'l> {
    buffer: &'l [u8],
    offset: usize,
}

impl<'l> Buffer<'l> {
    pub fn new(buffer: &'l [u8]) -> Buffer<'l> {
        Buffer { buffer, offset: 0 }
    }

    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    pub fn set_offset(mut self, o: usize) -> Option<Self> {
        if o <= self.size() {
            self.offset = o;
            Some(self)
        } else {
            None
        }
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.buffer.get(self.offset).copied()
    }

    pub fn get_u8(&mut self) -> Option<u8> {
        let ret = self.peek_u8()?;
        self.offset += 1;
        Some(ret)
    }

    pub fn get_bytes(&mut self, b: usize) -> Option<&'l [u8]> {
        let end = self.offset.checked_add(b)?;
        if end <= self.buffer.len() {
            let ret = &self.buffer[self.offset..end];
            self.offset = end;
            Some(ret)
        } else {
            None
        }
    }

    pub fn get_be16(&mut self) -> Option<u16> {
        let bytes = self.get_bytes(std::mem::size_of::<u16>())?;
        Some(u16::from_be_bytes(bytes.try_into().ok()?))
    }

    pub fn get_ipv4(&mut self) -> Option<std::net::Ipv4Addr> {
        let bytes = self.get_bytes(std::mem::size_of::<[u8; 4]>())?;
        Some(std::net::Ipv4Addr::new(
            bytes[0], bytes[1], bytes[2], bytes[3],
        ))
    }
}

#[test]
fn test_get_u8() {
    let data = [0x45, 0x00];
    let mut buffer = Buffer::new(&data);
    assert_eq!(buffer.peek_u8(), Some(0x45));
    assert_eq!(buffer.get_u8(), Some(0x45));
    assert_eq!(buffer.get_u8(), Some(0x00));
    assert_eq!(buffer.get_u8(), None);
    assert_eq!(buffer.peek_u8(), None);
}

#[test]
fn test_get_bytes() {
    let data = [1, 2, 3, 4];
    let mut buffer = Buffer::new(&data);
    assert_eq!(buffer.get_bytes(2), Some(&[1u8, 2][..]));
    assert_eq!(buffer.get_bytes(3), None);
    assert_eq!(buffer.get_bytes(2), Some(&[3u8, 4][..]));
    assert_eq!(buffer.get_bytes(usize::MAX), None);
}

#[test]
fn test_get_be16() {
    let data = [0x00, 0x35, 0xc0];
    let mut buffer = Buffer::new(&data);
    assert_eq!(buffer.get_be16(), Some(53));
    assert_eq!(buffer.get_be16(), None)
}

#[test]
fn test_get_ipv4() {
    let data = [203, 0, 113, 1, 10];
    let mut buffer = Buffer::new(&data);
    assert_eq!(buffer.get_ipv4(), Some(std::net::Ipv4Addr::new(203, 0, 113, 1)));
    assert_eq!(buffer.get_ipv4(), None)
}

#[test]
fn test_set_offset() {
    let data = [0, 0, 0, 0, 0, 0x00, 0x35, 7];
    let mut buffer = Buffer::new(&data).set_offset(5).unwrap();
    assert_eq!(buffer.get_be16(), Some(53));
    assert_eq!(buffer.get_u8(), Some(7));
    assert_eq!(buffer.get_u8(), None);
    assert!(Buffer::new(&data).set_offset(8).is_some());
    assert!(Buffer::new(&data).set_offset(9).is_none());
}
