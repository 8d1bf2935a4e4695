pub fn sanitize_filename(filename: &str) -> String {
    filename.replace(
        |c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_' && c != ' ',
        "_",
    )
}
