//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Dovetail.
//
// Dovetail is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Dovetail is distributed in the hope that  it will be useful,  but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along with
// Dovetail. If not, see <http://www.gnu.org/licenses/>.

/// Print a message to stderr and exit with the given `Sysexit`.
macro_rules! die {
    ($ex:expr, $($args:tt)*) => {{
        eprintln!($($args)*);
        $ex.exit()
    }};
}

pub mod main;

mod check_auth;
mod deliver;
