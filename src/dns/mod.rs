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
 *  DNS message handling for the tunnel filter.
 */
pub mod answer;
pub mod dnspkt;
pub mod parse;

/// Parse a complete DNS message from a UDP payload.
pub fn parse_message(payload: &[u8]) -> Result<dnspkt::DNSPkt, String> {
    parse::PktParser::new(payload).get_dns()
}
